// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::callbacks::Callbacks;
use crate::shared::constants::*;
use crate::shared::error::{ErrorKind, ErrorValue};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Identity the monitor assumes after forking. All fields optional; unset
/// fields keep the inherited identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub groups: Option<Vec<u32>>,
}

impl Credentials {
    pub fn is_unset(&self) -> bool {
        self.uid.is_none() && self.gid.is_none() && self.groups.is_none()
    }
}

/// Where the monitor process writes its own log lines.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
pub enum LogMethod {
    Stdout,
    Stderr,
    File(PathBuf),
    #[default]
    Disabled,
}

/// Everything the monitor needs to know, frozen at `init`. The host builds
/// one of these, optionally layers environment overrides on top with
/// [`Config::apply_env`], and hands it to `init`; the monitor owns it from
/// then on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the external tracer program. Must be set; `init` fails
    /// otherwise.
    pub tracer_path: PathBuf,
    /// Argument template. Each word may contain the substitution tokens
    /// `%p` (target pid), `%t` (thread ids), `%k` (attribute pairs),
    /// `%o` (resolved output path), and `%m` (shell-quoted message).
    pub tracer_args: Vec<String>,
    /// Process the tracer inspects. Defaults to the process that called
    /// `init`.
    pub target_pid: Option<u32>,
    pub credentials: Credentials,
    /// OOM-kill preference applied to the monitor after fork.
    pub oom_score_adj: Option<i32>,
    /// Joins formatted attribute pairs inside `%k`.
    pub pair_separator: char,
    /// Joins a key to its value inside `%k`.
    pub kv_separator: char,
    /// Joins thread ids inside `%t`.
    pub thread_separator: char,
    /// Output file pattern; supports `%p`, `%u` (unix timestamp), and `%n`
    /// (per-monitor sequence number).
    pub output_pattern: String,
    /// How long `init` waits for the monitor's handshake. `None` waits
    /// forever.
    pub handshake_timeout: Option<Duration>,
    /// Budget for one tracer invocation. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Outstanding non-fatal requests held before admissions are rejected.
    pub queue_bound: usize,
    /// Stop the target process while the tracer runs.
    pub suspend_threads: bool,
    /// Working directory for tracer children.
    pub chdir: Option<PathBuf>,
    /// File mode creation mask for tracer children.
    pub umask: Option<u32>,
    pub log_method: LogMethod,
    /// Attribute pairs seeded into every new session.
    pub initial_attributes: Vec<(String, String)>,
    #[serde(skip)]
    pub callbacks: Callbacks,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self {
            tracer_path: PathBuf::new(),
            tracer_args: Vec::new(),
            target_pid: None,
            credentials: Credentials::default(),
            oom_score_adj: None,
            pair_separator: DEFAULT_PAIR_SEPARATOR,
            kv_separator: DEFAULT_KV_SEPARATOR,
            thread_separator: DEFAULT_THREAD_SEPARATOR,
            output_pattern: std::env::temp_dir()
                .join(DEFAULT_OUTPUT_PATTERN)
                .to_string_lossy()
                .into_owned(),
            handshake_timeout: None,
            request_timeout: None,
            queue_bound: DEFAULT_QUEUE_BOUND,
            suspend_threads: false,
            chdir: None,
            umask: None,
            log_method: LogMethod::Disabled,
            initial_attributes: Vec::new(),
            callbacks: Callbacks::default(),
        }
    }

    /// Defaults plus any environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        config.apply_env();
        config
    }

    /// Layers the `BCD_*` environment variables over the current values.
    /// Only the invocation-level fields are reachable this way; credentials,
    /// timeouts, and callbacks are code-only.
    pub fn apply_env(&mut self) {
        if let Ok(invoke) = std::env::var(ENV_INVOKE) {
            let mut words = invoke.split_whitespace().map(str::to_string);
            if let Some(path) = words.next() {
                self.tracer_path = PathBuf::from(path);
                self.tracer_args = words.collect();
            }
        }
        if let Ok(pairs) = std::env::var(ENV_KV) {
            for pair in pairs.split(',').filter(|p| !p.is_empty()) {
                match pair.split_once(':') {
                    Some((key, value)) => self
                        .initial_attributes
                        .push((key.to_string(), value.to_string())),
                    None => self.initial_attributes.push((pair.to_string(), String::new())),
                }
            }
        }
        if let Some(sep) = env_separator(ENV_PAIR_SEPARATOR) {
            self.pair_separator = sep;
        }
        if let Some(sep) = env_separator(ENV_KV_SEPARATOR) {
            self.kv_separator = sep;
        }
        if let Some(sep) = env_separator(ENV_THREAD_SEPARATOR) {
            self.thread_separator = sep;
        }
        if let Ok(pattern) = std::env::var(ENV_OUTPUT_FILE) {
            if !pattern.is_empty() {
                self.output_pattern = pattern;
            }
        }
    }

    /// Checked once by `init`; the configuration is immutable afterwards.
    pub(crate) fn validate(&self) -> Result<(), ErrorValue> {
        if self.tracer_path.as_os_str().is_empty() {
            return Err(ErrorValue::new(
                ErrorKind::InvalidConfig,
                "tracer path is not set",
            ));
        }
        if !is_executable(&self.tracer_path) {
            return Err(ErrorValue::new(
                ErrorKind::InvalidConfig,
                format!("tracer is not executable: {}", self.tracer_path.display()),
            ));
        }
        for (name, sep) in [
            ("pair", self.pair_separator),
            ("kv", self.kv_separator),
            ("thread", self.thread_separator),
        ] {
            if sep == '\0' {
                return Err(ErrorValue::new(
                    ErrorKind::InvalidConfig,
                    format!("{name} separator must be a printable character"),
                ));
            }
        }
        if self.output_pattern.is_empty() {
            return Err(ErrorValue::new(
                ErrorKind::InvalidConfig,
                "output pattern is empty",
            ));
        }
        if self.queue_bound == 0 {
            return Err(ErrorValue::new(
                ErrorKind::InvalidConfig,
                "queue bound must be at least 1",
            ));
        }
        Ok(())
    }
}

fn env_separator(name: &str) -> Option<char> {
    std::env::var(name).ok().and_then(|v| {
        let mut chars = v.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c != '\0' => Some(c),
            _ => None,
        }
    })
}

fn is_executable(path: &std::path::Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(c_path.as_ptr(), libc::X_OK) == 0 }
}
