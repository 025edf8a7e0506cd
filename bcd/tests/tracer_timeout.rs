// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use bcd::{Config, ThreadHandle};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[test]
fn overrunning_tracer_is_killed_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("monitor-errors.log");

    let mut config = Config::new();
    config.tracer_path = "/bin/sleep".into();
    config.tracer_args = vec!["10".into()];
    config.request_timeout = Some(Duration::from_secs(1));
    config.output_pattern = dir.path().join("out.%n").to_string_lossy().into_owned();
    let sink = report.clone();
    config.callbacks.monitor_error = Some(Arc::new(move |err| {
        if let Ok(mut file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sink)
        {
            let _ = writeln!(file, "{:?}", err.kind());
        }
    }));

    bcd::init(config).unwrap();
    let mut handle = ThreadHandle::attach().unwrap();

    let started = Instant::now();
    handle.emit("hung").unwrap();

    let deadline = Instant::now() + Duration::from_secs(8);
    loop {
        if let Ok(contents) = std::fs::read_to_string(&report) {
            if contents.contains("TimedOut") {
                break;
            }
        }
        assert!(Instant::now() < deadline, "no timeout report arrived");
        std::thread::sleep(Duration::from_millis(50));
    }

    // Well before the tracer's own 10 seconds: the budget plus the kill
    // ladder, not the sleep, decides when this ends.
    assert!(started.elapsed() < Duration::from_secs(6));

    handle.detach().unwrap();
    bcd::teardown().unwrap();
}
