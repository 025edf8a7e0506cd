// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

//! Low-level process plumbing shared by the host and monitor sides: forking
//! without atfork handlers, pre-allocated execve, descriptor hygiene, child
//! reaping, and poll helpers.
//!
//! Everything here that is reachable from a signal context sticks to the
//! async-signal-safe surface documented in
//! <https://man7.org/linux/man-pages/man7/signal-safety.7.html>.

use anyhow::Context;
use libc::{nfds_t, pollfd, POLLHUP, POLLIN};
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{Gid, Pid, Uid};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{IntoRawFd, RawFd};
use std::path::Path;
use std::time::{Duration, Instant};

/// An argv/envp image laid out ahead of time so that the exec itself needs no
/// further allocation. The `_cstrings` fields keep the pointed-to storage
/// alive for as long as the pointer arrays are.
pub struct PreparedExec {
    binary_path: CString,
    #[allow(dead_code)]
    args_cstrings: Vec<CString>,
    args_ptrs: Vec<*const libc::c_char>,
    #[allow(dead_code)]
    env_cstrings: Vec<CString>,
    env_ptrs: Vec<*const libc::c_char>,
}

// The raw pointers only reference the owned CString storage above.
unsafe impl Send for PreparedExec {}
unsafe impl Sync for PreparedExec {}

impl PreparedExec {
    /// Fails if any input contains an interior NUL byte.
    pub fn new(binary_path: &str, args: &[String], env: &[(String, String)]) -> anyhow::Result<Self> {
        let binary_path = CString::new(binary_path).context("binary path contains NUL")?;

        let args_cstrings = args
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .context("argument contains NUL")?;
        let args_ptrs = args_cstrings
            .iter()
            .map(|a| a.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let env_cstrings = env
            .iter()
            .map(|(k, v)| CString::new(format!("{k}={v}")))
            .collect::<Result<Vec<_>, _>>()
            .context("environment entry contains NUL")?;
        let env_ptrs = env_cstrings
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        Ok(Self {
            binary_path,
            args_cstrings,
            args_ptrs,
            env_cstrings,
            env_ptrs,
        })
    }

    /// Replaces the current process image. Only returns on failure.
    ///
    /// SAFETY: the pointer arrays are built in `new` and are NULL-terminated.
    pub fn exec(&self) -> Result<(), Errno> {
        unsafe {
            if libc::execve(
                self.binary_path.as_ptr(),
                self.args_ptrs.as_ptr(),
                self.env_ptrs.as_ptr(),
            ) == -1
            {
                Err(Errno::last())
            } else {
                Ok(())
            }
        }
    }
}

/// Forks without running atfork handlers on Linux, where library-installed
/// handlers may take locks that are not consistent in the child. On macOS the
/// plain `fork()` is used; its lower-level alternatives constrain the child
/// too much to be useful here.
///
/// Returns 0 in the child, the child pid in the parent, negative on error.
#[cfg(target_os = "linux")]
pub fn alt_fork() -> libc::pid_t {
    use libc::{c_ulong, c_void, pid_t, syscall, SYS_clone, SIGCHLD};

    let mut _ptid: pid_t = 0;
    let mut _ctid: pid_t = 0;

    // Mirror the flags glibc fork() passes to clone(), minus the atfork
    // machinery that lives in the wrapper rather than the syscall.
    let res = unsafe {
        syscall(
            SYS_clone,
            (libc::CLONE_CHILD_CLEARTID | libc::CLONE_CHILD_SETTID | SIGCHLD) as c_ulong,
            std::ptr::null_mut::<c_void>(),
            &mut _ptid as *mut pid_t,
            &mut _ctid as *mut pid_t,
            0 as c_ulong,
        )
    };

    (res as i64).clamp(pid_t::MIN as i64, pid_t::MAX as i64) as pid_t
}

#[cfg(not(target_os = "linux"))]
pub fn alt_fork() -> libc::pid_t {
    unsafe { libc::fork() }
}

/// Kills the current process without raising an abort or running atexit
/// handlers.
pub fn terminate() -> ! {
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

/// Opens `path` for appending (creating it if needed) and returns the raw fd.
pub fn open_output_file(path: &Path) -> anyhow::Result<RawFd> {
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .with_context(|| format!("failed to open or create {}", path.display()))?;
    Ok(file.into_raw_fd())
}

/// Opens `/dev/null` for reading. Some environments (chroot jails) lack it,
/// so this failure is surfaced rather than papered over.
pub fn open_devnull_read() -> anyhow::Result<RawFd> {
    let file = File::open("/dev/null").context("failed to open /dev/null")?;
    Ok(file.into_raw_fd())
}

/// Non-blocking child reaper.
/// * Returns true once the child has been collected (or was already gone).
/// * Returns an error if the child is still alive when the budget runs out.
// Note: POSIX characterizes waitpid() as async-signal-safe, despite folklore
// to the contrary on some platforms.
pub fn reap_child_non_blocking(pid: Pid, timeout: Duration) -> anyhow::Result<bool> {
    let start_time = Instant::now();

    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => anyhow::ensure!(
                start_time.elapsed() <= timeout,
                "timeout waiting for child {pid} to exit"
            ),
            Ok(_status) => return Ok(true),
            Err(Errno::ECHILD) => {
                // Someone else collected the exit status. Nothing left to do.
                return Ok(true);
            }
            Err(e) => anyhow::bail!("error waiting for child {pid}: {e}"),
        }
    }
}

/// Polls a set of descriptors, retrying on EINTR. `timeout_ms` of -1 blocks
/// indefinitely. Returns the number of ready descriptors.
pub fn poll_fds(fds: &mut [pollfd], timeout_ms: i32) -> io::Result<usize> {
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as nfds_t, timeout_ms) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// true if the descriptor became readable (or hit EOF), false on timeout.
pub fn wait_for_readable(target_fd: RawFd, timeout_ms: i32) -> anyhow::Result<bool> {
    let mut fds = [pollfd {
        fd: target_fd,
        events: POLLIN | POLLHUP,
        revents: 0,
    }];
    let ready = poll_fds(&mut fds, timeout_ms).context("poll failed")?;
    Ok(ready > 0)
}

/// Closes every descriptor above stderr that is not listed in `keep`.
/// Descriptors inherited across fork would otherwise leak into the child for
/// its whole lifetime.
pub fn close_inherited_fds(keep: &[RawFd]) {
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
            let open_fds: Vec<RawFd> = entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
                .collect();
            for fd in open_fds {
                if fd > 2 && !keep.contains(&fd) {
                    let _ = unsafe { libc::close(fd) };
                }
            }
            return;
        }
    }
    // No procfs: sweep a conventional range instead.
    for fd in 3..1024 {
        if !keep.contains(&fd) {
            let _ = unsafe { libc::close(fd) };
        }
    }
}

/// Drops privileges in the conventional order: supplementary groups first,
/// then gid, then uid. Once the uid changes the process cannot regain the
/// rights needed for the earlier steps.
pub fn apply_credentials(
    uid: Option<u32>,
    gid: Option<u32>,
    groups: Option<&[u32]>,
) -> anyhow::Result<()> {
    if let Some(groups) = groups {
        #[cfg(not(any(target_os = "macos", target_os = "ios")))]
        {
            let gids: Vec<Gid> = groups.iter().map(|g| Gid::from_raw(*g)).collect();
            nix::unistd::setgroups(&gids).context("setgroups failed")?;
        }
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        let _ = groups;
    }
    if let Some(gid) = gid {
        nix::unistd::setgid(Gid::from_raw(gid)).context("setgid failed")?;
    }
    if let Some(uid) = uid {
        nix::unistd::setuid(Uid::from_raw(uid)).context("setuid failed")?;
    }
    Ok(())
}

/// Adjusts the kernel's OOM-kill preference for the current process.
/// A no-op on platforms without the procfs knob.
pub fn adjust_oom_score(adj: i32) -> anyhow::Result<()> {
    #[cfg(target_os = "linux")]
    {
        std::fs::write("/proc/self/oom_score_adj", format!("{adj}\n"))
            .context("failed to write oom_score_adj")?;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = adj;
    Ok(())
}

/// Thread ids of the given process, in directory order. Empty when the
/// platform offers no cheap enumeration.
pub fn process_thread_ids(pid: i32) -> Vec<i32> {
    #[cfg(target_os = "linux")]
    {
        let mut tids: Vec<i32> = std::fs::read_dir(format!("/proc/{pid}/task"))
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
                    .collect()
            })
            .unwrap_or_default();
        tids.sort_unstable();
        return tids;
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepared_exec_rejects_interior_nul() {
        assert!(PreparedExec::new("/bin/true", &["a\0b".to_string()], &[]).is_err());
        assert!(PreparedExec::new("/bin/true", &[], &[("K".to_string(), "a\0".to_string())]).is_err());
        assert!(PreparedExec::new("/bin/true", &["ok".to_string()], &[]).is_ok());
    }

    #[test]
    fn open_output_file_creates_and_appends() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("out.log");
        let fd = open_output_file(&path)?;
        assert!(fd >= 0);
        let _ = unsafe { libc::close(fd) };
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn wait_for_readable_times_out_on_quiet_pipe() -> anyhow::Result<()> {
        let (read_end, write_end) = nix::unistd::pipe()?;
        let fd = std::os::fd::AsRawFd::as_raw_fd(&read_end);
        assert!(!wait_for_readable(fd, 10)?);
        nix::unistd::write(&write_end, b"x")?;
        assert!(wait_for_readable(fd, 10)?);
        Ok(())
    }

    #[test]
    fn reap_collects_exited_child() -> anyhow::Result<()> {
        match alt_fork() {
            0 => terminate(),
            pid if pid > 0 => {
                assert!(reap_child_non_blocking(Pid::from_raw(pid), Duration::from_secs(5))?);
                Ok(())
            }
            _ => anyhow::bail!("fork failed"),
        }
    }

    #[test]
    fn current_process_has_at_least_one_thread() {
        let tids = process_thread_ids(std::process::id() as i32);
        #[cfg(target_os = "linux")]
        assert!(!tids.is_empty());
        #[cfg(not(target_os = "linux"))]
        assert!(tids.is_empty());
    }
}
