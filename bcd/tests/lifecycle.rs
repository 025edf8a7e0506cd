// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use bcd::{Config, ErrorKind, ThreadHandle};
use std::path::PathBuf;
use std::time::{Duration, Instant};

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn lifecycle_with_a_quiet_tracer() {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::new();
    config.tracer_path = PathBuf::from("/bin/true");
    config.tracer_args = vec!["%p".into(), "%k".into(), "%m".into()];
    config.output_pattern = dir
        .path()
        .join("trace.%n.out")
        .to_string_lossy()
        .into_owned();

    bcd::init(config.clone()).unwrap();

    // Only one monitor per process.
    assert_eq!(
        bcd::init(config).unwrap_err().kind(),
        ErrorKind::AlreadyInitialized
    );

    let mut handle = ThreadHandle::attach().unwrap();
    handle.kv("app", "svc").unwrap();
    handle.emit("x").unwrap();

    // Admission already succeeded; the tracer output appears asynchronously
    // and stays empty because /bin/true writes nothing.
    let output = dir.path().join("trace.1.out");
    wait_until("the tracer output file", || output.exists());
    assert_eq!(std::fs::metadata(&output).unwrap().len(), 0);

    handle.kv_delete("app").unwrap();
    handle.kv_delete("never-existed").unwrap();
    handle.detach().unwrap();

    bcd::teardown().unwrap();

    // The listen socket is gone with the monitor.
    wait_until("the listen socket to disappear", || {
        !std::env::temp_dir()
            .join(format!("bcd.{}", std::process::id()))
            .exists()
    });
}
