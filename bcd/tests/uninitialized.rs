// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use bcd::{Config, ErrorKind, ThreadHandle};

#[test]
fn nothing_works_before_init() {
    // Rejected configurations never leave the process initialized.
    assert_eq!(
        bcd::init(Config::new()).unwrap_err().kind(),
        ErrorKind::InvalidConfig
    );
    let mut config = Config::new();
    config.tracer_path = "/etc/hostname".into();
    assert_eq!(
        bcd::init(config).unwrap_err().kind(),
        ErrorKind::InvalidConfig
    );

    assert_eq!(
        ThreadHandle::attach().unwrap_err().kind(),
        ErrorKind::NotInitialized
    );
    assert_eq!(
        bcd::teardown().unwrap_err().kind(),
        ErrorKind::NotInitialized
    );

    // With no monitor there is nowhere to report to; this returns instead of
    // blocking or dying.
    bcd::fatal("nothing to report to");
}
