// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::shared::constants::ERROR_MESSAGE_MAX;
use serde::{Deserialize, Serialize};

/// Classifies every failure this library can report. The discriminants are
/// stable: they appear as the status byte in replies and acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorKind {
    Ok = 0,
    NotInitialized = 1,
    AlreadyInitialized = 2,
    InvalidConfig = 3,
    ForkFailed = 4,
    SocketFailed = 5,
    HandshakeFailed = 6,
    ChannelClosed = 7,
    ProtocolViolation = 8,
    QueueFull = 9,
    TimedOut = 10,
    SpawnFailed = 11,
    TracerNonzeroExit = 12,
    PermissionDenied = 13,
    ResourceLimit = 14,
}

impl ErrorKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a wire status byte. Unknown values collapse to
    /// `ProtocolViolation` rather than being trusted.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ErrorKind::Ok,
            1 => ErrorKind::NotInitialized,
            2 => ErrorKind::AlreadyInitialized,
            3 => ErrorKind::InvalidConfig,
            4 => ErrorKind::ForkFailed,
            5 => ErrorKind::SocketFailed,
            6 => ErrorKind::HandshakeFailed,
            7 => ErrorKind::ChannelClosed,
            8 => ErrorKind::ProtocolViolation,
            9 => ErrorKind::QueueFull,
            10 => ErrorKind::TimedOut,
            11 => ErrorKind::SpawnFailed,
            12 => ErrorKind::TracerNonzeroExit,
            13 => ErrorKind::PermissionDenied,
            14 => ErrorKind::ResourceLimit,
            _ => ErrorKind::ProtocolViolation,
        }
    }
}

/// The diagnostic carrier produced by every fallible operation: a kind plus
/// a short human-readable message.
///
/// The message is bounded and free of interior NUL bytes, so it can always be
/// handed to C callers or copied into fixed storage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ErrorValue {
    kind: ErrorKind,
    message: String,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl AsRef<str>) -> Self {
        let mut sanitized: String = message.as_ref().chars().filter(|c| *c != '\0').collect();
        if sanitized.len() > ERROR_MESSAGE_MAX {
            let mut cut = ERROR_MESSAGE_MAX;
            while !sanitized.is_char_boundary(cut) {
                cut -= 1;
            }
            sanitized.truncate(cut);
        }
        Self {
            kind,
            message: sanitized,
        }
    }

    pub fn ok() -> Self {
        Self {
            kind: ErrorKind::Ok,
            message: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.kind == ErrorKind::Ok
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip_covers_all_kinds() {
        for value in 0..=14u8 {
            assert_eq!(ErrorKind::from_u8(value).as_u8(), value);
        }
        assert_eq!(ErrorKind::from_u8(200), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn message_is_bounded() {
        let long = "x".repeat(10 * ERROR_MESSAGE_MAX);
        let err = ErrorValue::new(ErrorKind::TimedOut, &long);
        assert_eq!(err.message().len(), ERROR_MESSAGE_MAX);
        assert_eq!(err.kind(), ErrorKind::TimedOut);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut long = "a".repeat(ERROR_MESSAGE_MAX - 1);
        long.push('é');
        long.push_str("tail");
        let err = ErrorValue::new(ErrorKind::InvalidConfig, &long);
        assert!(err.message().len() <= ERROR_MESSAGE_MAX);
        assert!(err.message().is_char_boundary(err.message().len()));
    }

    #[test]
    fn interior_nuls_are_stripped() {
        let err = ErrorValue::new(ErrorKind::SpawnFailed, "bad\0path");
        assert_eq!(err.message(), "badpath");
    }

    #[test]
    fn ok_value_is_empty() {
        let ok = ErrorValue::ok();
        assert!(ok.is_ok());
        assert!(ok.message().is_empty());
        assert_eq!(ok.to_string(), "Ok: ");
    }
}
