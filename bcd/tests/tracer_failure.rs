// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use bcd::{Config, ThreadHandle};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn failing_tracer_reaches_the_monitor_error_callback() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("monitor-errors.log");

    let mut config = Config::new();
    config.tracer_path = "/bin/false".into();
    config.output_pattern = dir.path().join("out.%n").to_string_lossy().into_owned();
    // The hook runs in the monitor process, so it talks back through a file.
    let sink = report.clone();
    config.callbacks.monitor_error = Some(Arc::new(move |err| {
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sink)
        {
            let _ = writeln!(file, "{:?}|{}", err.kind(), err.message());
        }
    }));

    bcd::init(config).unwrap();
    let mut handle = ThreadHandle::attach().unwrap();
    handle.emit("x").unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let contents = loop {
        if let Ok(contents) = std::fs::read_to_string(&report) {
            if !contents.is_empty() {
                break contents;
            }
        }
        assert!(
            Instant::now() < deadline,
            "the monitor-error callback never fired"
        );
        std::thread::sleep(Duration::from_millis(25));
    };

    assert!(contents.contains("TracerNonzeroExit"), "got: {contents}");
    assert!(contents.contains("status 1"), "got: {contents}");

    handle.detach().unwrap();
    bcd::teardown().unwrap();
}
