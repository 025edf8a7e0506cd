// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runs the external tracer. One request at a time per target process:
//!
//! ```text
//! ADMITTED -> BUILDING_ARGS -> SPAWNED -> WAITING
//!                                           |-> COMPLETED
//!                                           |-> TIMED_OUT
//!                                           `-> SPAWN_FAILED
//! ```
//!
//! Transitions are linear and there are no retries. Failures, timeouts, and
//! non-zero exits are delivered through the monitor-error callback; nothing
//! here ever touches the host process except the optional SIGSTOP/SIGCONT
//! bracket around an invocation.

use crate::shared::callbacks::Callbacks;
use crate::shared::config::{Config, Credentials};
use crate::shared::constants::{REAP_BUDGET, TRACER_KILL_GRACE};
use crate::shared::error::{ErrorKind, ErrorValue};
use bcd_common::unix::{
    alt_fork, apply_credentials, open_devnull_read, open_output_file, process_thread_ids,
    reap_child_non_blocking, terminate, PreparedExec,
};
use bcd_common::Deadline;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestClass {
    Emit,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestState {
    Admitted,
    BuildingArgs,
    Spawned,
    Waiting,
    Completed,
    TimedOut,
    SpawnFailed,
}

/// A dequeued trace request, bound to the attribute snapshot taken when
/// argument construction began.
#[derive(Debug)]
pub(crate) struct TraceRequest {
    pub class: RequestClass,
    pub message: String,
    pub attributes: Vec<(String, String)>,
    pub session: Option<u64>,
    pub state: RequestState,
}

impl TraceRequest {
    pub fn new(
        class: RequestClass,
        message: String,
        attributes: Vec<(String, String)>,
        session: Option<u64>,
    ) -> Self {
        Self {
            class,
            message,
            attributes,
            session,
            state: RequestState::Admitted,
        }
    }
}

struct RunningTracer {
    pid: Pid,
    deadline: Deadline,
    term_sent: Option<Instant>,
    request: TraceRequest,
    output: PathBuf,
}

enum ChildOutcome {
    Exited(i32),
    Signaled(i32),
    Gone,
}

pub(crate) struct Invoker {
    config: Config,
    target_pid: i32,
    sequence: u64,
    running: Option<RunningTracer>,
    last_result: ErrorKind,
}

impl Invoker {
    pub fn new(config: Config, target_pid: i32) -> Self {
        Self {
            config,
            target_pid,
            sequence: 0,
            running: None,
            last_result: ErrorKind::Ok,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_none()
    }

    /// How long the caller may sleep before this invoker needs attention
    /// again, in `poll(2)` milliseconds. Child exit does not wake a sleeping
    /// caller by itself, so a running invocation is bounded by a short reap
    /// tick even when the request has no deadline.
    pub fn poll_timeout_ms(&self) -> i32 {
        const REAP_TICK_MS: i32 = 50;
        match &self.running {
            None => -1,
            Some(running) => {
                let until_action = match running.term_sent {
                    Some(sent) => {
                        let grace_left = TRACER_KILL_GRACE.saturating_sub(sent.elapsed());
                        grace_left.as_millis().min(i32::MAX as u128) as i32
                    }
                    None => running.deadline.poll_timeout_ms(),
                };
                if until_action < 0 {
                    REAP_TICK_MS
                } else {
                    until_action.min(REAP_TICK_MS)
                }
            }
        }
    }

    /// Takes a request through BUILDING_ARGS and SPAWNED. The invoker must be
    /// idle. Spawn failures are reported through the callback and leave the
    /// invoker idle again.
    pub fn start(&mut self, mut request: TraceRequest, callbacks: &Callbacks) {
        request.state = RequestState::BuildingArgs;
        self.sequence += 1;
        let output = resolve_output_pattern(
            &self.config.output_pattern,
            self.target_pid,
            self.sequence,
        );
        let argv = self.build_argv(&request, &output.to_string_lossy());
        debug!(
            ?argv,
            session = ?request.session,
            attributes = %serde_json::to_string(&request.attributes).unwrap_or_default(),
            output = %output.display(),
            "tracer arguments built"
        );

        let env: Vec<(String, String)> = std::env::vars().collect();
        let tracer_path = self.config.tracer_path.to_string_lossy().into_owned();
        let prepared = match PreparedExec::new(&tracer_path, &argv, &env) {
            Ok(prepared) => prepared,
            Err(e) => return self.fail_spawn(request, callbacks, e.to_string()),
        };
        let output_fd = match open_output_file(&output) {
            Ok(fd) => fd,
            Err(e) => return self.fail_spawn(request, callbacks, e.to_string()),
        };
        let stdin_fd = match open_devnull_read() {
            Ok(fd) => fd,
            Err(e) => {
                let _ = unsafe { libc::close(output_fd) };
                return self.fail_spawn(request, callbacks, e.to_string());
            }
        };

        if self.config.suspend_threads {
            let _ = kill(Pid::from_raw(self.target_pid), Signal::SIGSTOP);
        }

        request.state = RequestState::Spawned;
        match alt_fork() {
            0 => run_tracer_child(
                &prepared,
                stdin_fd,
                output_fd,
                self.config.chdir.as_deref(),
                self.config.umask,
                &self.config.credentials,
            ),
            pid if pid > 0 => {
                let _ = unsafe { libc::close(stdin_fd) };
                let _ = unsafe { libc::close(output_fd) };
                info!(pid, class = ?request.class, "tracer spawned");
                request.state = RequestState::Waiting;
                self.running = Some(RunningTracer {
                    pid: Pid::from_raw(pid),
                    deadline: Deadline::new(self.config.request_timeout),
                    term_sent: None,
                    request,
                    output,
                });
            }
            _ => {
                let _ = unsafe { libc::close(stdin_fd) };
                let _ = unsafe { libc::close(output_fd) };
                if self.config.suspend_threads {
                    let _ = kill(Pid::from_raw(self.target_pid), Signal::SIGCONT);
                }
                let detail = std::io::Error::last_os_error().to_string();
                self.fail_spawn(request, callbacks, format!("fork failed: {detail}"));
            }
        }
    }

    /// Non-blocking progress check: reaps an exited child, or escalates
    /// SIGTERM to SIGKILL once the budget runs out.
    pub fn poll(&mut self, callbacks: &Callbacks) {
        let outcome = match &mut self.running {
            None => return,
            Some(running) => match check_running(running) {
                None => return,
                Some(outcome) => outcome,
            },
        };
        self.complete(outcome, callbacks);
    }

    /// Blocks until the current invocation is over. The timeout ladder keeps
    /// running, so a bounded request cannot wedge the caller.
    pub fn wait_blocking(&mut self, callbacks: &Callbacks) {
        while self.running.is_some() {
            self.poll(callbacks);
            if self.running.is_some() {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }

    /// Runs one request start to finish and reports how it ended. Any
    /// invocation already in flight is allowed to finish first.
    pub fn run_to_completion(&mut self, request: TraceRequest, callbacks: &Callbacks) -> ErrorKind {
        self.wait_blocking(callbacks);
        self.last_result = ErrorKind::Ok;
        self.start(request, callbacks);
        self.wait_blocking(callbacks);
        self.last_result
    }

    /// SIGKILLs and reaps whatever is still running. Used on the way out so
    /// no tracer child outlives the monitor.
    pub fn kill_outstanding(&mut self) {
        if let Some(running) = self.running.take() {
            warn!(pid = running.pid.as_raw(), "killing outstanding tracer");
            let _ = kill(running.pid, Signal::SIGKILL);
            let _ = reap_child_non_blocking(running.pid, REAP_BUDGET);
            if self.config.suspend_threads {
                let _ = kill(Pid::from_raw(self.target_pid), Signal::SIGCONT);
            }
        }
    }

    fn fail_spawn(&mut self, mut request: TraceRequest, callbacks: &Callbacks, detail: String) {
        request.state = RequestState::SpawnFailed;
        let err = ErrorValue::new(
            ErrorKind::SpawnFailed,
            format!("failed to spawn tracer: {detail}"),
        );
        warn!(
            class = ?request.class,
            state = ?request.state,
            message = err.message(),
            "tracer spawn failed"
        );
        self.last_result = err.kind();
        callbacks.dispatch_monitor_error(&err);
    }

    fn complete(&mut self, outcome: ChildOutcome, callbacks: &Callbacks) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        if self.config.suspend_threads {
            let _ = kill(Pid::from_raw(self.target_pid), Signal::SIGCONT);
        }

        let timed_out = running.term_sent.is_some();
        let (state, report) = match outcome {
            _ if timed_out => (
                RequestState::TimedOut,
                Some(ErrorValue::new(
                    ErrorKind::TimedOut,
                    format!(
                        "tracer exceeded its budget after {:?}",
                        running.deadline.elapsed()
                    ),
                )),
            ),
            ChildOutcome::Exited(0) | ChildOutcome::Gone => (RequestState::Completed, None),
            ChildOutcome::Exited(code) => (
                RequestState::Completed,
                Some(ErrorValue::new(
                    ErrorKind::TracerNonzeroExit,
                    format!(
                        "tracer exited with status {code}, output at {}",
                        running.output.display()
                    ),
                )),
            ),
            ChildOutcome::Signaled(signo) => (
                RequestState::Completed,
                Some(ErrorValue::new(
                    ErrorKind::TracerNonzeroExit,
                    format!("tracer was terminated by signal {signo}"),
                )),
            ),
        };
        running.request.state = state;
        match &report {
            None => {
                debug!(
                    class = ?running.request.class,
                    state = ?running.request.state,
                    output = %running.output.display(),
                    "tracer completed"
                );
                self.last_result = ErrorKind::Ok;
            }
            Some(err) => {
                warn!(
                    class = ?running.request.class,
                    state = ?running.request.state,
                    kind = ?err.kind(),
                    message = err.message(),
                    "tracer did not succeed"
                );
                self.last_result = err.kind();
                callbacks.dispatch_monitor_error(err);
            }
        }
    }

    fn build_argv(&self, request: &TraceRequest, output: &str) -> Vec<String> {
        let threads = process_thread_ids(self.target_pid)
            .iter()
            .map(|tid| tid.to_string())
            .collect::<Vec<_>>()
            .join(&self.config.thread_separator.to_string());
        let attributes = format_attributes(
            &request.attributes,
            self.config.kv_separator,
            self.config.pair_separator,
        );
        let message = shlex::try_quote(&request.message)
            .map(|quoted| quoted.into_owned())
            .unwrap_or_else(|_| request.message.clone());
        let subst = Substitutions {
            pid: self.target_pid.to_string(),
            threads,
            attributes,
            output,
            message: &message,
        };
        self.config
            .tracer_args
            .iter()
            .map(|token| expand_token(token, &subst))
            .collect()
    }
}

/// Reaps or escalates. `Some` means the child is gone and carries how it
/// ended; `None` means it is still running.
fn check_running(running: &mut RunningTracer) -> Option<ChildOutcome> {
    match waitpid(running.pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => {
            if running.deadline.expired() {
                match running.term_sent {
                    None => {
                        warn!(pid = running.pid.as_raw(), "tracer deadline passed, sending SIGTERM");
                        let _ = kill(running.pid, Signal::SIGTERM);
                        running.term_sent = Some(Instant::now());
                    }
                    Some(sent) if sent.elapsed() >= TRACER_KILL_GRACE => {
                        warn!(pid = running.pid.as_raw(), "tracer ignored SIGTERM, sending SIGKILL");
                        let _ = kill(running.pid, Signal::SIGKILL);
                        let _ = reap_child_non_blocking(running.pid, REAP_BUDGET);
                        return Some(ChildOutcome::Gone);
                    }
                    Some(_) => {}
                }
            }
            None
        }
        Ok(WaitStatus::Exited(_, code)) => Some(ChildOutcome::Exited(code)),
        Ok(WaitStatus::Signaled(_, signal, _)) => Some(ChildOutcome::Signaled(signal as i32)),
        Ok(_) => None,
        Err(Errno::ECHILD) => Some(ChildOutcome::Gone),
        Err(_) => Some(ChildOutcome::Gone),
    }
}

/// Tracer child setup between fork and exec. Never returns.
fn run_tracer_child(
    prepared: &PreparedExec,
    stdin_fd: RawFd,
    output_fd: RawFd,
    chdir: Option<&Path>,
    umask: Option<u32>,
    credentials: &Credentials,
) -> ! {
    unsafe {
        let _ = libc::dup2(stdin_fd, 0);
        let _ = libc::dup2(output_fd, 1);
        let _ = libc::dup2(output_fd, 2);
        let _ = libc::close(stdin_fd);
        let _ = libc::close(output_fd);
    }
    if let Some(dir) = chdir {
        if nix::unistd::chdir(dir).is_err() {
            terminate();
        }
    }
    if let Some(mask) = umask {
        unsafe { libc::umask(mask as libc::mode_t) };
    }
    if !credentials.is_unset()
        && apply_credentials(
            credentials.uid,
            credentials.gid,
            credentials.groups.as_deref(),
        )
        .is_err()
    {
        terminate();
    }
    let _ = prepared.exec();
    // Only reachable when exec itself failed.
    terminate();
}

struct Substitutions<'a> {
    pid: String,
    threads: String,
    attributes: String,
    output: &'a str,
    message: &'a str,
}

fn expand_token(token: &str, subst: &Substitutions<'_>) -> String {
    let mut out = String::with_capacity(token.len());
    let mut chars = token.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('p') => out.push_str(&subst.pid),
            Some('t') => out.push_str(&subst.threads),
            Some('k') => out.push_str(&subst.attributes),
            Some('o') => out.push_str(subst.output),
            Some('m') => out.push_str(subst.message),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn format_attributes(attributes: &[(String, String)], kv_sep: char, pair_sep: char) -> String {
    attributes
        .iter()
        .map(|(key, value)| format!("{key}{kv_sep}{value}"))
        .collect::<Vec<_>>()
        .join(&pair_sep.to_string())
}

fn resolve_output_pattern(pattern: &str, pid: i32, sequence: u64) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('p') => out.push_str(&pid.to_string()),
            Some('u') => out.push_str(&timestamp.to_string()),
            Some('n') => out.push_str(&sequence.to_string()),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    PathBuf::from(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subst<'a>(output: &'a str, message: &'a str) -> Substitutions<'a> {
        Substitutions {
            pid: "4242".to_string(),
            threads: "1,2,3".to_string(),
            attributes: "a:1 b:2".to_string(),
            output,
            message,
        }
    }

    #[test]
    fn tokens_substitute() {
        let s = subst("/tmp/out", "msg");
        assert_eq!(expand_token("%p", &s), "4242");
        assert_eq!(expand_token("--pid=%p", &s), "--pid=4242");
        assert_eq!(expand_token("%t", &s), "1,2,3");
        assert_eq!(expand_token("%k", &s), "a:1 b:2");
        assert_eq!(expand_token("%o", &s), "/tmp/out");
        assert_eq!(expand_token("%m", &s), "msg");
    }

    #[test]
    fn unknown_escapes_pass_through() {
        let s = subst("o", "m");
        assert_eq!(expand_token("%x", &s), "%x");
        assert_eq!(expand_token("100%%", &s), "100%");
        assert_eq!(expand_token("50%", &s), "50%");
    }

    #[test]
    fn attribute_formatting_uses_both_separators() {
        let attrs = vec![
            ("service".to_string(), "api".to_string()),
            ("env".to_string(), "prod".to_string()),
        ];
        assert_eq!(format_attributes(&attrs, ':', ' '), "service:api env:prod");
        assert_eq!(format_attributes(&attrs, '=', ';'), "service=api;env=prod");
        assert_eq!(format_attributes(&[], ':', ' '), "");
    }

    #[test]
    fn output_pattern_resolution() {
        let path = resolve_output_pattern("/tmp/bcd.%p.%n.out", 7, 3);
        assert_eq!(path, PathBuf::from("/tmp/bcd.7.3.out"));

        let path = resolve_output_pattern("/tmp/t.%u", 7, 1);
        let rendered = path.to_string_lossy().into_owned();
        let stamp: u64 = rendered.strip_prefix("/tmp/t.").unwrap().parse().unwrap();
        assert!(stamp > 1_600_000_000);
    }

    #[test]
    fn messages_are_shell_quoted_in_argv() {
        let mut config = Config::new();
        config.tracer_path = "/bin/true".into();
        config.tracer_args = vec!["%m".to_string()];
        let invoker = Invoker::new(config, 1);
        let request = TraceRequest::new(
            RequestClass::Emit,
            "two words; $dangerous".to_string(),
            Vec::new(),
            None,
        );
        let argv = invoker.build_argv(&request, "/tmp/out");
        assert_eq!(
            argv,
            vec![shlex::try_quote("two words; $dangerous").unwrap().into_owned()]
        );
    }

    #[test]
    fn requests_begin_admitted() {
        let request = TraceRequest::new(RequestClass::Fatal, "m".into(), Vec::new(), None);
        assert_eq!(request.state, RequestState::Admitted);
    }

    #[test]
    fn idle_invoker_blocks_indefinitely() {
        let mut config = Config::new();
        config.tracer_path = "/bin/true".into();
        let invoker = Invoker::new(config, 1);
        assert!(invoker.is_idle());
        assert_eq!(invoker.poll_timeout_ms(), -1);
    }
}
