// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use bcd::{Config, ThreadHandle};

#[test]
fn two_threads_emit_concurrently_on_private_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::new();
    config.tracer_path = "/bin/true".into();
    config.tracer_args = vec!["%k".into()];
    config.output_pattern = dir.path().join("out.%n").to_string_lossy().into_owned();
    // Admissions outpace /bin/true invocations by a lot; give the queue room
    // for the whole burst.
    config.queue_bound = 512;
    bcd::init(config).unwrap();

    let workers: Vec<_> = (0..2)
        .map(|worker| {
            std::thread::spawn(move || {
                let mut handle = ThreadHandle::attach().unwrap();
                for i in 0..100 {
                    handle.kv(&format!("key-{worker}-{i}"), "1").unwrap();
                    handle.emit(&format!("burst {worker}/{i}")).unwrap();
                }
                handle.detach().unwrap();
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    bcd::teardown().unwrap();
}
