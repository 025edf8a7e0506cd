// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire-protocol constants and build-time bounds shared by the host and
//! monitor halves. Both ends of every pipe and socket must agree on these,
//! so they live in one place.

use std::time::Duration;

// Operation codes for frames on a per-thread session socket.

/// Insert or replace one attribute. Payload: key string, value string.
pub const OP_KV_SET: u8 = 1;
/// Remove one attribute. Payload: key string. Removing an absent key is OK.
pub const OP_KV_DELETE: u8 = 2;
/// Enqueue a non-fatal trace request. Payload: grouping message string.
pub const OP_EMIT: u8 = 3;
/// Tear down the session. Payload: empty.
pub const OP_DETACH: u8 = 4;
/// Fatal trace record. Only ever appears on the control pipe, never on a
/// session socket.
pub const OP_FATAL: u8 = 5;

/// Frame header: op byte plus 4-byte little-endian payload length.
pub const FRAME_HEADER_LEN: usize = 5;

/// Each string inside a frame payload carries a 2-byte little-endian length
/// prefix and is capped at this many bytes.
pub const STRING_MAX: usize = 1024;

/// Upper bound on a frame payload; no operation carries more than two
/// strings.
pub const FRAME_PAYLOAD_MAX: usize = 2 * (2 + STRING_MAX);

/// Bound on the message carried by a fatal record. The whole record (op,
/// length, message) stays far below PIPE_BUF so the single write on the
/// control pipe is atomic.
pub const FATAL_MESSAGE_MAX: usize = 256;

/// Total size of an encoded fatal record at its largest.
pub const FATAL_RECORD_MAX: usize = 1 + 2 + FATAL_MESSAGE_MAX;

/// Bound on the human-readable message inside an error value. Kept short so
/// error values can be copied into fixed buffers and converted to C strings.
pub const ERROR_MESSAGE_MAX: usize = 255;

// Defaults applied by `Config::new`.

pub const DEFAULT_PAIR_SEPARATOR: char = ' ';
pub const DEFAULT_KV_SEPARATOR: char = ':';
pub const DEFAULT_THREAD_SEPARATOR: char = ',';

/// Outstanding non-fatal trace requests the monitor will hold before
/// rejecting admissions.
pub const DEFAULT_QUEUE_BOUND: usize = 64;

/// Grace period between SIGTERM and SIGKILL when a tracer overruns its
/// budget.
pub const TRACER_KILL_GRACE: Duration = Duration::from_millis(500);

/// Budget for reaping a child that was just SIGKILLed.
pub const REAP_BUDGET: Duration = Duration::from_millis(200);

/// Listen sockets are created as `bcd.<host pid>` under the temp directory.
pub const SOCKET_PREFIX: &str = "bcd";

/// Default output file pattern, resolved per request, relative to the temp
/// directory. `%p` is the target pid, `%u` the unix timestamp, `%n` a
/// monotone sequence number.
pub const DEFAULT_OUTPUT_PATTERN: &str = "bcd.%p.%u.%n.out";

// Environment variables honored by `Config::from_env`. A preload shim sets
// these before the application's main runs.

/// Tracer path followed by template words, whitespace separated.
pub const ENV_INVOKE: &str = "BCD_INVOKE";
/// Attribute pairs seeded into every session, `key:value` joined by commas.
pub const ENV_KV: &str = "BCD_KV";
pub const ENV_PAIR_SEPARATOR: &str = "BCD_PAIR_SEPARATOR";
pub const ENV_KV_SEPARATOR: &str = "BCD_KV_SEPARATOR";
pub const ENV_THREAD_SEPARATOR: &str = "BCD_THREAD_SEPARATOR";
pub const ENV_OUTPUT_FILE: &str = "BCD_OUTPUT_FILE";
/// Filter directives for the monitor's log subscriber.
pub const ENV_LOG: &str = "BCD_LOG";
