// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod deadline;
#[cfg(unix)]
pub mod unix;

pub use deadline::Deadline;
