// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::host::state::STATE;
use crate::shared::constants::*;
use crate::shared::error::{ErrorKind, ErrorValue};
use crate::shared::protocol;
use std::os::unix::net::UnixStream;

/// A single thread's connection to the monitor.
///
/// Each thread that reports errors owns exactly one handle; sharing a handle
/// across threads is not supported. Every operation is a synchronous
/// request/response round trip on the handle's private socket, so requests
/// from one thread are processed and answered in order.
///
/// Once the channel breaks, the failure is reported through the
/// request-error callback and the handle stays poisoned: every later
/// operation fails with `ChannelClosed`. Dropping the handle closes the
/// socket, which is enough for the monitor to retire the session.
#[derive(Debug)]
pub struct ThreadHandle {
    stream: Option<UnixStream>,
}

impl ThreadHandle {
    /// Connects to the monitor and registers a new session for the calling
    /// thread.
    pub fn attach() -> Result<Self, ErrorValue> {
        let _gate = STATE.gate.enter();
        if !STATE.is_initialized() {
            return Err(ErrorValue::new(
                ErrorKind::NotInitialized,
                "no monitor is running for this process",
            ));
        }
        let path = STATE.listen_path().ok_or_else(|| {
            ErrorValue::new(ErrorKind::NotInitialized, "monitor listen path is unknown")
        })?;
        let stream = UnixStream::connect(&path).map_err(|e| {
            ErrorValue::new(
                ErrorKind::SocketFailed,
                format!("failed to connect to {}: {e}", path.display()),
            )
        })?;
        Ok(Self {
            stream: Some(stream),
        })
    }

    /// Inserts or replaces one attribute in this thread's session. The new
    /// value is visible to every trace request admitted afterwards.
    pub fn kv(&mut self, key: &str, value: &str) -> Result<(), ErrorValue> {
        self.round_trip(OP_KV_SET, &[key, value])
    }

    /// Removes one attribute. Removing an absent key succeeds.
    pub fn kv_delete(&mut self, key: &str) -> Result<(), ErrorValue> {
        self.round_trip(OP_KV_DELETE, &[key])
    }

    /// Requests a non-fatal trace. Returns once the monitor has admitted the
    /// request; the tracer itself runs asynchronously and reports its
    /// outcome through the monitor-error callback.
    pub fn emit(&mut self, group_message: &str) -> Result<(), ErrorValue> {
        self.round_trip(OP_EMIT, &[group_message])
    }

    /// Retires this thread's session. The handle is unusable afterwards;
    /// every later operation fails with `ChannelClosed`.
    pub fn detach(&mut self) -> Result<(), ErrorValue> {
        let _gate = STATE.gate.enter();
        let result = self.round_trip(OP_DETACH, &[]);
        self.stream = None;
        result
    }

    fn round_trip(&mut self, op: u8, strings: &[&str]) -> Result<(), ErrorValue> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ErrorValue::new(
                ErrorKind::ChannelClosed,
                "the session channel is closed",
            ));
        };

        let io_result = match protocol::write_frame(stream, op, strings) {
            Ok(()) => protocol::read_reply(stream),
            Err(e) => Err(e),
        };

        match io_result {
            Ok(reply) if reply.is_ok() => Ok(()),
            Ok(reply) => Err(reply),
            Err(e) => {
                // The transport itself broke; poison the handle.
                self.stream = None;
                let err = ErrorValue::new(
                    ErrorKind::ChannelClosed,
                    format!("session channel failed: {e}"),
                );
                STATE.dispatch_request_error(&err);
                Err(err)
            }
        }
    }
}
