// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::config::LogMethod;
use crate::shared::constants::ENV_LOG;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(ENV_LOG).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the monitor's log subscriber. The host process never calls this;
/// its half of the library stays silent.
pub(crate) fn enable(method: &LogMethod) {
    match method {
        LogMethod::Disabled => {}
        LogMethod::Stdout => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stdout)
                .try_init();
        }
        LogMethod::Stderr => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter())
                .with_writer(std::io::stderr)
                .try_init();
        }
        LogMethod::File(path) => {
            match std::fs::File::options().create(true).append(true).open(path) {
                Ok(file) => {
                    let file = Arc::new(file);
                    let _ = tracing_subscriber::fmt()
                        .with_env_filter(filter())
                        .with_ansi(false)
                        .with_writer(move || Arc::clone(&file))
                        .try_init();
                }
                Err(_) => {
                    let _ = tracing_subscriber::fmt()
                        .with_env_filter(filter())
                        .with_writer(std::io::stderr)
                        .try_init();
                }
            }
        }
    }
}
