// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use logbus::rotation::{FileSinkConfig, RotatingFile, RotationScheduler, TriggerSources};
use nix::sys::signal::{raise, Signal};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn sighup_rotates_the_sink() {
    // Keeps the process alive if SIGHUP arrives before the scheduler listens.
    let _guard = signal(SignalKind::hangup()).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let file = Arc::new(
        RotatingFile::open(FileSinkConfig {
            path: dir.path().join("logbus.log"),
            max_size_mb: 0,
            max_backups: 3,
            max_age_days: 0,
        })
        .unwrap(),
    );
    file.write_line("before the signal").unwrap();

    let scheduler = RotationScheduler::spawn_with(
        Arc::clone(&file),
        CancellationToken::new(),
        TriggerSources {
            daily: false,
            hangup: true,
        },
    );

    for _ in 0..100 {
        if scheduler.completed() > 0 {
            break;
        }
        raise(Signal::SIGHUP).unwrap();
        sleep(Duration::from_millis(50)).await;
    }
    scheduler.stop().await;

    assert!(file.rotations() >= 1);
    assert!(!file.backups().unwrap().is_empty());
    assert_eq!(std::fs::read_to_string(file.path()).unwrap(), "");
}
