// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::host::state::STATE;
use crate::monitor;
use crate::shared::config::Config;
use crate::shared::error::{ErrorKind, ErrorValue};
use crate::shared::protocol;
use bcd_common::unix::{alt_fork, wait_for_readable};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::time::Duration;

/// Spawns the monitor process and completes the startup handshake.
///
/// On success the configuration is frozen and owned by the monitor; the host
/// keeps only the control pipe (for fatal records) and the status pipe (for
/// the acknowledgement). Fails with `AlreadyInitialized` if a monitor is
/// already attached to this process.
pub fn init(config: Config) -> Result<(), ErrorValue> {
    let _gate = STATE.gate.enter();
    if STATE.is_initialized() {
        return Err(ErrorValue::new(
            ErrorKind::AlreadyInitialized,
            "a monitor is already running for this process",
        ));
    }
    config.validate()?;

    let request_error_hook = config.callbacks.request_error.clone();
    let handshake_timeout = config.handshake_timeout;

    let (control_read, control_write) = make_pipe()?;
    let (status_read, status_write) = make_pipe()?;

    match alt_fork() {
        0 => {
            // Monitor child. Drop the host's pipe ends and never return.
            drop(control_write);
            drop(status_read);
            monitor::run(config, control_read, status_write)
        }
        pid if pid > 0 => {
            drop(control_read);
            drop(status_write);
            match read_handshake(status_read.as_raw_fd(), handshake_timeout) {
                Ok(listen_path) => {
                    STATE.publish(
                        pid,
                        control_write.into_raw_fd(),
                        status_read.into_raw_fd(),
                        listen_path,
                        request_error_hook,
                    );
                    Ok(())
                }
                Err(err) => {
                    // The child either reported the failure and exited, or is
                    // wedged; make sure it is gone before surfacing the error.
                    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                    let _ = waitpid(Pid::from_raw(pid), None);
                    Err(err)
                }
            }
        }
        _ => Err(ErrorValue::new(
            ErrorKind::ForkFailed,
            format!("fork failed: {}", std::io::Error::last_os_error()),
        )),
    }
}

/// Detaches from and reaps the monitor. Closing the control pipe is the
/// shutdown signal; the monitor kills any outstanding tracer child and exits
/// on end-of-file. A later `init` may start a fresh monitor.
pub fn teardown() -> Result<(), ErrorValue> {
    let _gate = STATE.gate.enter();
    if !STATE.is_initialized() {
        return Err(ErrorValue::new(
            ErrorKind::NotInitialized,
            "no monitor is running for this process",
        ));
    }
    let pid = STATE.monitor_pid();
    STATE.clear();
    if pid > 0 {
        let _ = waitpid(Pid::from_raw(pid), None);
    }
    Ok(())
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd), ErrorValue> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(|e| {
        ErrorValue::new(ErrorKind::ResourceLimit, format!("pipe creation failed: {e}"))
    })
}

fn read_handshake(fd: RawFd, timeout: Option<Duration>) -> Result<PathBuf, ErrorValue> {
    if let Some(timeout) = timeout {
        let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        match wait_for_readable(fd, ms) {
            Ok(true) => {}
            Ok(false) => {
                return Err(ErrorValue::new(
                    ErrorKind::HandshakeFailed,
                    "timed out waiting for the monitor handshake",
                ))
            }
            Err(e) => {
                return Err(ErrorValue::new(
                    ErrorKind::HandshakeFailed,
                    format!("handshake poll failed: {e}"),
                ))
            }
        }
    }
    match protocol::read_handshake(fd) {
        Ok(Ok(payload)) => Ok(PathBuf::from(std::ffi::OsStr::from_bytes(&payload))),
        Ok(Err(err)) => Err(err),
        Err(e) => Err(ErrorValue::new(
            ErrorKind::HandshakeFailed,
            format!("monitor exited before completing the handshake: {e}"),
        )),
    }
}
