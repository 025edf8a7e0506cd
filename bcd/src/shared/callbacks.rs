// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::error::ErrorValue;
use std::fmt;
use std::sync::Arc;

pub type ErrorHook = Arc<dyn Fn(&ErrorValue) + Send + Sync>;

/// The two user-supplied notification slots, bundled as one capability
/// record so user context can ride along in the closures instead of global
/// state.
///
/// `monitor_error` runs inside the monitor process when a request cannot be
/// serviced or a tracer fails; `request_error` runs in the host process when
/// a channel operation fails. Hooks must not call back into this library.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub monitor_error: Option<ErrorHook>,
    pub request_error: Option<ErrorHook>,
}

impl Callbacks {
    pub(crate) fn dispatch_monitor_error(&self, err: &ErrorValue) {
        if let Some(hook) = &self.monitor_error {
            hook(err);
        }
    }

    pub(crate) fn dispatch_request_error(&self, err: &ErrorValue) {
        if let Some(hook) = &self.request_error {
            hook(err);
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("monitor_error", &self.monitor_error.is_some())
            .field("request_error", &self.request_error.is_some())
            .finish()
    }
}
