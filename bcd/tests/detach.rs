// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use bcd::{Config, ErrorKind, ThreadHandle};

#[test]
fn a_detached_handle_stays_closed_without_touching_other_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::new();
    config.tracer_path = "/bin/true".into();
    config.output_pattern = dir.path().join("out.%n").to_string_lossy().into_owned();
    bcd::init(config).unwrap();

    let mut first = ThreadHandle::attach().unwrap();
    let mut second = ThreadHandle::attach().unwrap();

    first.kv("k", "v").unwrap();
    first.detach().unwrap();

    for err in [
        first.kv("k", "v2").unwrap_err(),
        first.kv_delete("k").unwrap_err(),
        first.emit("too late").unwrap_err(),
        first.detach().unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::ChannelClosed);
    }

    // The sibling session never noticed.
    second.kv("x", "y").unwrap();
    second.emit("still alive").unwrap();
    second.detach().unwrap();

    bcd::teardown().unwrap();
}
