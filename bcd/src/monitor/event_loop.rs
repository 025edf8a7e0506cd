// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The monitor's single-threaded loop. One `poll(2)` multiplexes the control
//! pipe, the listen socket, and every session socket; requests are serviced
//! in the order the loop observes them, which gives every session a total
//! order of effects without any monitor-side locking.

use crate::monitor::invoker::{Invoker, RequestClass, TraceRequest};
use crate::monitor::session::Session;
use crate::shared::callbacks::Callbacks;
use crate::shared::config::Config;
use crate::shared::constants::*;
use crate::shared::error::{ErrorKind, ErrorValue};
use crate::shared::protocol::{self, Frame};
use bcd_common::unix::poll_fds;
use libc::{pollfd, POLLIN};
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MonitorStatus {
    Ready,
    Terminating,
}

/// An admitted non-fatal request waiting for the invoker. The attribute
/// snapshot is refreshed from the live session when the request is dequeued,
/// so attribute updates that raced ahead of a slow tracer are not lost.
struct QueuedEmit {
    session: u64,
    message: String,
    attributes: Vec<(String, String)>,
}

pub(crate) struct EventLoop {
    callbacks: Callbacks,
    queue_bound: usize,
    initial_attributes: Vec<(String, String)>,
    control: OwnedFd,
    status: OwnedFd,
    listener: UnixListener,
    listen_path: PathBuf,
    sessions: Vec<Session>,
    next_session_id: u64,
    queue: VecDeque<QueuedEmit>,
    invoker: Invoker,
    state: MonitorStatus,
}

impl EventLoop {
    pub fn new(
        config: Config,
        target_pid: i32,
        control: OwnedFd,
        status: OwnedFd,
        listener: UnixListener,
        listen_path: PathBuf,
    ) -> Self {
        let callbacks = config.callbacks.clone();
        let queue_bound = config.queue_bound;
        let initial_attributes = config.initial_attributes.clone();
        Self {
            callbacks,
            queue_bound,
            initial_attributes,
            control,
            status,
            listener,
            listen_path,
            sessions: Vec::new(),
            next_session_id: 1,
            queue: VecDeque::new(),
            invoker: Invoker::new(config, target_pid),
            state: MonitorStatus::Ready,
        }
    }

    pub fn run(mut self) -> ! {
        debug!(state = ?self.state, "entering event loop");
        loop {
            self.invoker.poll(&self.callbacks);
            self.dispatch_queued();

            let mut fds: Vec<pollfd> = Vec::with_capacity(2 + self.sessions.len());
            fds.push(pollfd {
                fd: self.control.as_raw_fd(),
                events: POLLIN,
                revents: 0,
            });
            fds.push(pollfd {
                fd: self.listener.as_raw_fd(),
                events: POLLIN,
                revents: 0,
            });
            for session in &self.sessions {
                fds.push(pollfd {
                    fd: session.stream.as_raw_fd(),
                    events: POLLIN,
                    revents: 0,
                });
            }

            match poll_fds(&mut fds, self.invoker.poll_timeout_ms()) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "poll failed");
                    continue;
                }
            }

            let control_ready = fds[0].revents != 0;
            let listener_ready = fds[1].revents != 0;
            let ready_sessions: Vec<u64> = self
                .sessions
                .iter()
                .enumerate()
                .filter(|&(i, _)| fds[i + 2].revents != 0)
                .map(|(_, s)| s.id)
                .collect();

            // Session frames that arrived in the same round as a fatal record
            // are answered first, so a thread mid-request still gets its
            // admission reply before the monitor commits to dying.
            for id in ready_sessions {
                self.service_session(id);
            }
            if control_ready {
                self.service_control();
            }
            if listener_ready {
                self.accept_pending();
            }
        }
    }

    fn dispatch_queued(&mut self) {
        while self.invoker.is_idle() {
            let Some(queued) = self.queue.pop_front() else {
                break;
            };
            let attributes = self
                .sessions
                .iter()
                .find(|s| s.id == queued.session)
                .map(|s| s.attributes.snapshot())
                .unwrap_or(queued.attributes);
            let request = TraceRequest::new(
                RequestClass::Emit,
                queued.message,
                attributes,
                Some(queued.session),
            );
            self.invoker.start(request, &self.callbacks);
        }
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let id = self.next_session_id;
                    self.next_session_id += 1;
                    debug!(session = id, "session attached");
                    self.sessions
                        .push(Session::new(id, stream, &self.initial_attributes));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn service_session(&mut self, id: u64) {
        let Some(idx) = self.sessions.iter().position(|s| s.id == id) else {
            return;
        };
        match protocol::read_frame(&mut self.sessions[idx].stream) {
            Ok(Some(frame)) => self.dispatch_frame(idx, frame),
            Ok(None) => {
                debug!(session = id, "session closed by peer");
                self.sessions.remove(idx);
            }
            Err(e) => {
                warn!(session = id, error = %e, "session read failed");
                self.sessions.remove(idx);
            }
        }
    }

    fn dispatch_frame(&mut self, idx: usize, frame: Frame) {
        let session_id = self.sessions[idx].id;
        let mut retire = false;
        let reply = match frame.op {
            OP_KV_SET => match protocol::decode_strings(&frame.payload, 2) {
                Ok(mut strings) => {
                    let value = strings.pop().unwrap_or_default();
                    let key = strings.pop().unwrap_or_default();
                    self.sessions[idx].attributes.set(key, value);
                    debug!(
                        session = session_id,
                        total = self.sessions[idx].attributes.len(),
                        "attribute set"
                    );
                    ErrorValue::ok()
                }
                Err(err) => {
                    retire = true;
                    err
                }
            },
            OP_KV_DELETE => match protocol::decode_strings(&frame.payload, 1) {
                Ok(mut strings) => {
                    let key = strings.pop().unwrap_or_default();
                    debug!(session = session_id, key = key.as_str(), "attribute deleted");
                    self.sessions[idx].attributes.delete(&key);
                    ErrorValue::ok()
                }
                Err(err) => {
                    retire = true;
                    err
                }
            },
            OP_EMIT => match protocol::decode_strings(&frame.payload, 1) {
                Ok(mut strings) => self.admit_emit(idx, strings.pop().unwrap_or_default()),
                Err(err) => {
                    retire = true;
                    err
                }
            },
            OP_DETACH => {
                debug!(session = session_id, "session detached");
                retire = true;
                ErrorValue::ok()
            }
            op => {
                warn!(session = session_id, op, "unknown operation");
                retire = true;
                ErrorValue::new(
                    ErrorKind::ProtocolViolation,
                    format!("unknown operation {op}"),
                )
            }
        };

        if protocol::write_reply(&mut self.sessions[idx].stream, &reply).is_err() {
            retire = true;
        }
        if retire {
            self.sessions.remove(idx);
        }
    }

    fn admit_emit(&mut self, idx: usize, message: String) -> ErrorValue {
        if self.queue.len() >= self.queue_bound {
            let err = ErrorValue::new(
                ErrorKind::QueueFull,
                format!("trace queue is at its bound of {}", self.queue_bound),
            );
            warn!(session = self.sessions[idx].id, "trace request rejected, queue full");
            self.callbacks.dispatch_monitor_error(&err);
            return err;
        }
        let session = &self.sessions[idx];
        self.queue.push_back(QueuedEmit {
            session: session.id,
            message,
            attributes: session.attributes.snapshot(),
        });
        debug!(
            session = session.id,
            depth = self.queue.len(),
            "trace request admitted"
        );
        ErrorValue::ok()
    }

    /// The control pipe only ever carries fatal records and the host-exit
    /// EOF, and both end with the monitor gone, so this never returns.
    fn service_control(&mut self) -> ! {
        let control_fd = self.control.as_raw_fd();
        match protocol::read_byte_fd(control_fd) {
            Ok(None) => {
                info!("host closed the control pipe");
                self.shutdown(0)
            }
            Ok(Some(OP_FATAL)) => {
                let mut len_bytes = [0u8; 2];
                if protocol::read_exact_fd(control_fd, &mut len_bytes).is_err() {
                    error!("truncated fatal record");
                    self.shutdown(0);
                }
                let len = u16::from_le_bytes(len_bytes) as usize;
                if len > FATAL_MESSAGE_MAX {
                    error!(len, "fatal record exceeds the bound");
                    self.shutdown(0);
                }
                let mut message = vec![0u8; len];
                if protocol::read_exact_fd(control_fd, &mut message).is_err() {
                    error!("truncated fatal record");
                    self.shutdown(0);
                }
                self.handle_fatal(String::from_utf8_lossy(&message).into_owned())
            }
            Ok(Some(op)) => {
                error!(op, "unexpected byte on the control pipe");
                self.shutdown(0)
            }
            Err(e) => {
                error!(error = %e, "control pipe read failed");
                self.shutdown(0)
            }
        }
    }

    fn handle_fatal(&mut self, message: String) -> ! {
        info!(message = message.as_str(), "fatal record received");
        if !self.queue.is_empty() {
            warn!(
                dropped = self.queue.len(),
                "discarding queued trace requests in favor of the fatal one"
            );
            self.queue.clear();
        }

        // No originating session: snapshot every live session's attributes,
        // first writer wins on duplicate keys.
        let mut attributes: Vec<(String, String)> = Vec::new();
        for session in &self.sessions {
            for (key, value) in session.attributes.iter() {
                if !attributes.iter().any(|(k, _)| k == key) {
                    attributes.push((key.clone(), value.clone()));
                }
            }
        }

        let request = TraceRequest::new(RequestClass::Fatal, message, attributes, None);
        let outcome = self.invoker.run_to_completion(request, &self.callbacks);
        let _ = protocol::write_all_fd(self.status.as_raw_fd(), &[outcome.as_u8()]);
        self.shutdown(0)
    }

    fn shutdown(&mut self, code: i32) -> ! {
        self.state = MonitorStatus::Terminating;
        self.invoker.kill_outstanding();
        let _ = std::fs::remove_file(&self.listen_path);
        info!(code, sessions = self.sessions.len(), "monitor exiting");
        unsafe { libc::_exit(code) }
    }
}
