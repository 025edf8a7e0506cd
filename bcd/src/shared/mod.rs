// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod callbacks;
pub mod config;
pub mod constants;
pub mod error;
pub mod protocol;
