// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The out-of-process half. `run` is entered in the forked child and never
//! returns: it prepares the process (session leadership, descriptor hygiene,
//! credentials, OOM preference), binds the listen socket, reports the result
//! on the status pipe, and hands control to the event loop.

mod event_loop;
mod invoker;
mod log;
mod session;

use crate::shared::config::Config;
use crate::shared::constants::SOCKET_PREFIX;
use crate::shared::error::{ErrorKind, ErrorValue};
use crate::shared::protocol;
use bcd_common::unix::{adjust_oom_score, apply_credentials, close_inherited_fds};
use event_loop::EventLoop;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use tracing::{error, info, warn};

pub(crate) fn run(config: Config, control: OwnedFd, status: OwnedFd) -> ! {
    // Detach from the host's controlling terminal and process group so
    // signals aimed at the host do not take the monitor down with it.
    let _ = nix::unistd::setsid();

    close_inherited_fds(&[control.as_raw_fd(), status.as_raw_fd()]);
    log::enable(&config.log_method);

    let host_pid = nix::unistd::getppid().as_raw();
    let target_pid = config.target_pid.map(|p| p as i32).unwrap_or(host_pid);

    match prepare(&config, host_pid) {
        Ok((listener, listen_path)) => {
            let handshake = protocol::write_handshake(
                status.as_raw_fd(),
                ErrorKind::Ok.as_u8(),
                listen_path.as_os_str().as_bytes(),
            );
            if handshake.is_err() {
                // The host is gone already; nothing to supervise.
                let _ = std::fs::remove_file(&listen_path);
                unsafe { libc::_exit(1) };
            }
            info!(
                pid = std::process::id(),
                target = target_pid,
                path = %listen_path.display(),
                "monitor ready"
            );
            EventLoop::new(config, target_pid, control, status, listener, listen_path).run()
        }
        Err(err) => {
            error!(kind = ?err.kind(), message = err.message(), "monitor startup failed");
            let _ = protocol::write_handshake(
                status.as_raw_fd(),
                err.kind().as_u8(),
                err.message().as_bytes(),
            );
            unsafe { libc::_exit(1) }
        }
    }
}

fn prepare(config: &Config, host_pid: i32) -> Result<(UnixListener, PathBuf), ErrorValue> {
    if !config.credentials.is_unset() {
        apply_credentials(
            config.credentials.uid,
            config.credentials.gid,
            config.credentials.groups.as_deref(),
        )
        .map_err(|e| ErrorValue::new(ErrorKind::PermissionDenied, e.to_string()))?;
    }
    if let Some(adj) = config.oom_score_adj {
        if let Err(e) = adjust_oom_score(adj) {
            warn!(error = %e, "could not adjust the OOM score");
        }
    }
    bind_listener(host_pid)
}

/// Binds the listen socket at its deterministic path. A stale socket left by
/// an earlier process with the same pid is unlinked, but only after checking
/// that nothing is accepting on it.
fn bind_listener(host_pid: i32) -> Result<(UnixListener, PathBuf), ErrorValue> {
    let path = std::env::temp_dir().join(format!("{SOCKET_PREFIX}.{host_pid}"));

    if path.exists() {
        match UnixStream::connect(&path) {
            Ok(_) => {
                return Err(ErrorValue::new(
                    ErrorKind::SocketFailed,
                    format!("{} is in use by a live monitor", path.display()),
                ));
            }
            Err(_) => {
                warn!(path = %path.display(), "removing stale listen socket");
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    let listener = UnixListener::bind(&path).map_err(|e| {
        ErrorValue::new(
            ErrorKind::SocketFailed,
            format!("failed to bind {}: {e}", path.display()),
        )
    })?;
    let perms = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(&path, perms).map_err(|e| {
        ErrorValue::new(
            ErrorKind::SocketFailed,
            format!("failed to restrict {}: {e}", path.display()),
        )
    })?;
    listener.set_nonblocking(true).map_err(|e| {
        ErrorValue::new(ErrorKind::SocketFailed, format!("listener setup failed: {e}"))
    })?;
    Ok((listener, path))
}
