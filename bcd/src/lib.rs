// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! An out-of-process error and crash reporting supervisor.
//!
//! Architecturally, this library consists of two halves:
//! 1. The host side, linked into the application. `init` forks a monitor
//!    process and keeps two pipes to it: a control pipe the host writes fatal
//!    records to, and a status pipe the monitor answers on. Each application
//!    thread that wants to report errors attaches its own [`ThreadHandle`],
//!    which owns a private stream socket to the monitor. Attribute updates
//!    and non-fatal error reports travel over that socket as framed
//!    request/response pairs.
//! 2. The monitor process, which owns all the work that is unsafe to do from
//!    a corrupted or signal-interrupted address space: it listens for
//!    per-thread sessions, keeps their attribute maps, and runs an external
//!    tracer program against the host with arguments built from a
//!    caller-supplied template. Tracer children are spawned one at a time per
//!    target process and reaped with an optional timeout.
//!
//! The fatal path is designed to be callable from a signal handler: it
//! performs no heap allocation, takes no locks beyond a spin-acquired
//! ordering gate, and consists of one `write` of a bounded record followed by
//! one blocking `read` of the acknowledgement byte. The monitor services a
//! fatal record synchronously, waits for the tracer to finish, acknowledges,
//! and exits; the host is never terminated by this library.

#[cfg(unix)]
mod host;
#[cfg(unix)]
mod monitor;
#[cfg(unix)]
mod shared;

#[cfg(unix)]
pub use host::{fatal, init, teardown, ThreadHandle};
#[cfg(unix)]
pub use shared::callbacks::{Callbacks, ErrorHook};
#[cfg(unix)]
pub use shared::config::{Config, Credentials, LogMethod};
#[cfg(unix)]
pub use shared::error::{ErrorKind, ErrorValue};
