// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

/// Serializes lifecycle operations process-wide.
///
/// Mutexes are not allowed in a signal handler, so this is a bare owner word
/// acquired with a CAS loop. A thread that already holds the gate passes
/// through instead of deadlocking, which covers a signal handler interrupting
/// a lifecycle operation on the same thread; the guard only releases on the
/// outermost exit.
pub(crate) struct Gate {
    owner: AtomicUsize,
}

const UNOWNED: usize = 0;

/// Stable nonzero identity for the calling thread.
///
/// SAFETY: pthread_self only reads thread-local state and is usable from a
/// signal context.
pub(crate) fn thread_token() -> usize {
    unsafe { libc::pthread_self() as usize }
}

impl Gate {
    pub const fn new() -> Self {
        Self {
            owner: AtomicUsize::new(UNOWNED),
        }
    }

    /// Blocks until the gate is held by the calling thread. Returns a guard
    /// that releases on drop only if this call actually acquired it.
    pub fn enter(&self) -> GateGuard<'_> {
        let me = thread_token();
        loop {
            match self.owner.compare_exchange(UNOWNED, me, SeqCst, SeqCst) {
                Ok(_) => {
                    return GateGuard {
                        gate: self,
                        release: true,
                    }
                }
                Err(current) if current == me => {
                    return GateGuard {
                        gate: self,
                        release: false,
                    }
                }
                Err(_) => {
                    // SAFETY: no preconditions; async-signal-safe.
                    unsafe { libc::sched_yield() };
                }
            }
        }
    }

    #[cfg(test)]
    fn is_held(&self) -> bool {
        self.owner.load(SeqCst) != UNOWNED
    }
}

pub(crate) struct GateGuard<'a> {
    gate: &'a Gate,
    release: bool,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if self.release {
            self.gate.owner.store(UNOWNED, SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn enter_and_release() {
        let gate = Gate::new();
        {
            let _guard = gate.enter();
            assert!(gate.is_held());
        }
        assert!(!gate.is_held());
    }

    #[test]
    fn reentry_does_not_deadlock_or_double_release() {
        let gate = Gate::new();
        let outer = gate.enter();
        {
            let _inner = gate.enter();
            assert!(gate.is_held());
        }
        // The inner guard must not have released the outer hold.
        assert!(gate.is_held());
        drop(outer);
        assert!(!gate.is_held());
    }

    #[test]
    fn contended_thread_waits_for_release() {
        let gate = Arc::new(Gate::new());
        let entered = Arc::new(AtomicBool::new(false));

        let guard = gate.enter();
        let worker = {
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            std::thread::spawn(move || {
                let _guard = gate.enter();
                entered.store(true, SeqCst);
            })
        };

        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!entered.load(SeqCst));
        drop(guard);
        worker.join().unwrap();
        assert!(entered.load(SeqCst));
    }

    #[test]
    fn thread_tokens_are_nonzero_and_distinct() {
        let mine = thread_token();
        assert_ne!(mine, 0);
        let theirs = std::thread::spawn(thread_token).join().unwrap();
        assert_ne!(mine, theirs);
    }
}
