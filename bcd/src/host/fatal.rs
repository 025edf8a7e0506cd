// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::host::gate::thread_token;
use crate::host::state::{FATAL_DONE, FATAL_IDLE, STATE};
use crate::shared::constants::FATAL_RECORD_MAX;
use crate::shared::protocol::encode_fatal_record;
use nix::errno::Errno;
use std::sync::atomic::Ordering::SeqCst;

// This function runs in a signal handler, so it is restricted to the
// async-signal-safe surface:
// <https://man7.org/linux/man-pages/man7/signal-safety.7.html>
// - read / write
// - sched_yield (via the ordering gate)
// - pthread_self (reads thread-local state only)
// No heap allocation, no mutexes, no buffered I/O. The record lives in a
// stack buffer and goes out in one write; the acknowledgement comes back in
// one read.

/// Reports a fatal error and blocks until the monitor has run the tracer and
/// acknowledged, or until the monitor is gone.
///
/// Callable from an asynchronous signal context. The caller is expected to
/// exit (or re-raise the signal) afterwards; this function never terminates
/// the process itself.
///
/// A second call from the same thread while one is in flight, or any call
/// after a fatal has completed, is a no-op. A call from another thread blocks
/// on the ordering gate until the first completes, then returns without
/// re-reporting.
///
/// PRECONDITIONS:
///     `init` must have returned success; otherwise this is a no-op.
/// SAFETY:
///     Not reentrant beyond the same-thread no-op described above.
pub fn fatal(message: &str) {
    let me = thread_token();
    match STATE.fatal_owner.load(SeqCst) {
        FATAL_DONE => return,
        owner if owner == me => return,
        _ => {}
    }

    let _gate = STATE.gate.enter();

    // Decide ownership under the gate. Losing the race means another thread
    // completed (or is completing) the report.
    if STATE
        .fatal_owner
        .compare_exchange(FATAL_IDLE, me, SeqCst, SeqCst)
        .is_err()
    {
        return;
    }

    let control_fd = STATE.control_fd();
    let status_fd = STATE.status_fd();
    if control_fd < 0 || status_fd < 0 {
        STATE.fatal_owner.store(FATAL_DONE, SeqCst);
        return;
    }

    let mut record = [0u8; FATAL_RECORD_MAX];
    let len = encode_fatal_record(&mut record, message.as_bytes());

    // One write; the record is smaller than PIPE_BUF so it cannot be split.
    let written = loop {
        let rc = unsafe { libc::write(control_fd, record.as_ptr() as *const libc::c_void, len) };
        if rc >= 0 {
            break rc as usize;
        }
        if Errno::last() != Errno::EINTR {
            break 0;
        }
    };

    if written == len {
        // One read for the acknowledgement byte. EOF means the monitor died;
        // either way there is nothing further to do from a signal context.
        let mut ack = [0u8; 1];
        loop {
            let rc = unsafe { libc::read(status_fd, ack.as_mut_ptr() as *mut libc::c_void, 1) };
            if rc >= 0 {
                break;
            }
            if Errno::last() != Errno::EINTR {
                break;
            }
        }
    }

    STATE.fatal_owner.store(FATAL_DONE, SeqCst);
}
