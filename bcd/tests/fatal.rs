// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use bcd::{Config, ErrorKind, ThreadHandle};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn fatal_blocks_for_the_tracer_then_retires_the_monitor() {
    let dir = tempfile::tempdir().unwrap();
    let request_errors = Arc::new(AtomicUsize::new(0));

    let mut config = Config::new();
    config.tracer_path = "/bin/true".into();
    config.tracer_args = vec!["%k".into(), "%m".into()];
    config.output_pattern = dir.path().join("fatal.%n.out").to_string_lossy().into_owned();
    let counter = Arc::clone(&request_errors);
    config.callbacks.request_error = Some(Arc::new(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    bcd::init(config).unwrap();
    let mut handle = ThreadHandle::attach().unwrap();
    handle.kv("stage", "shutdown-test").unwrap();

    // Blocks until the monitor has run the tracer and acknowledged.
    bcd::fatal("giving up");

    // By the time the acknowledgement arrived the tracer had finished, so
    // its output file is already in place.
    assert!(dir.path().join("fatal.1.out").exists());

    // Same-thread re-entry is a no-op.
    bcd::fatal("giving up again");

    // The monitor is gone; the session channel surfaces that as closed, and
    // the request-error hook hears about it.
    let err = handle.emit("after the end").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelClosed);
    assert!(request_errors.load(Ordering::SeqCst) >= 1);

    let err = handle.kv("k", "v").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelClosed);

    // Teardown still works: it reaps the exited monitor.
    bcd::teardown().unwrap();
}
