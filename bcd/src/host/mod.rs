// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The in-process half: lifecycle operations, per-thread handles, and the
//! signal-safe fatal path.

mod fatal;
mod gate;
mod handle;
mod init;
mod state;

pub use fatal::fatal;
pub use handle::ThreadHandle;
pub use init::{init, teardown};
