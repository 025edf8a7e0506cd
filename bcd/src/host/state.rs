// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::host::gate::Gate;
use crate::shared::callbacks::ErrorHook;
use crate::shared::error::ErrorValue;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering::SeqCst};
use std::sync::Mutex;

/// Sentinel values for `fatal_owner`.
pub(crate) const FATAL_IDLE: usize = 0;
pub(crate) const FATAL_DONE: usize = usize::MAX;

/// The only process-wide data in the library: the monitor's identity, the two
/// pipe descriptors, and the ordering gate. Everything the fatal path reads
/// lives in an atomic so no lock is needed from a signal context; the rest
/// sits behind a mutex that only lifecycle operations touch.
pub(crate) struct HostState {
    initialized: AtomicBool,
    monitor_pid: AtomicI32,
    /// Write end of the control pipe (fatal records go here).
    control_fd: AtomicI32,
    /// Read end of the status pipe (handshake and fatal acknowledgement).
    status_fd: AtomicI32,
    /// Token of the thread currently running `fatal`, or a sentinel.
    pub(crate) fatal_owner: AtomicUsize,
    pub(crate) gate: Gate,
    listen_path: Mutex<Option<PathBuf>>,
    request_error_hook: Mutex<Option<ErrorHook>>,
}

pub(crate) static STATE: HostState = HostState {
    initialized: AtomicBool::new(false),
    monitor_pid: AtomicI32::new(0),
    control_fd: AtomicI32::new(-1),
    status_fd: AtomicI32::new(-1),
    fatal_owner: AtomicUsize::new(FATAL_IDLE),
    gate: Gate::new(),
    listen_path: Mutex::new(None),
    request_error_hook: Mutex::new(None),
};

impl HostState {
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(SeqCst)
    }

    pub fn monitor_pid(&self) -> i32 {
        self.monitor_pid.load(SeqCst)
    }

    pub fn control_fd(&self) -> i32 {
        self.control_fd.load(SeqCst)
    }

    pub fn status_fd(&self) -> i32 {
        self.status_fd.load(SeqCst)
    }

    pub fn listen_path(&self) -> Option<PathBuf> {
        self.listen_path.lock().ok().and_then(|p| p.clone())
    }

    pub fn dispatch_request_error(&self, err: &ErrorValue) {
        let hook = self
            .request_error_hook
            .lock()
            .ok()
            .and_then(|h| h.clone());
        if let Some(hook) = hook {
            hook(err);
        }
    }

    /// Publishes a freshly initialized session. The descriptor stores are
    /// ordered before the `initialized` flip so a racing reader that sees the
    /// flag also sees the descriptors.
    pub fn publish(
        &self,
        monitor_pid: i32,
        control_fd: i32,
        status_fd: i32,
        listen_path: PathBuf,
        request_error_hook: Option<ErrorHook>,
    ) {
        if let Ok(mut slot) = self.listen_path.lock() {
            *slot = Some(listen_path);
        }
        if let Ok(mut slot) = self.request_error_hook.lock() {
            *slot = request_error_hook;
        }
        self.monitor_pid.store(monitor_pid, SeqCst);
        self.control_fd.store(control_fd, SeqCst);
        self.status_fd.store(status_fd, SeqCst);
        self.fatal_owner.store(FATAL_IDLE, SeqCst);
        self.initialized.store(true, SeqCst);
    }

    /// Clears the session and closes the pipe ends. Safe to call more than
    /// once; only descriptors still present are closed.
    pub fn clear(&self) {
        self.initialized.store(false, SeqCst);
        let control = self.control_fd.swap(-1, SeqCst);
        if control >= 0 {
            let _ = unsafe { libc::close(control) };
        }
        let status = self.status_fd.swap(-1, SeqCst);
        if status >= 0 {
            let _ = unsafe { libc::close(status) };
        }
        self.monitor_pid.store(0, SeqCst);
        if let Ok(mut slot) = self.listen_path.lock() {
            *slot = None;
        }
        if let Ok(mut slot) = self.request_error_hook.lock() {
            *slot = None;
        }
    }
}
