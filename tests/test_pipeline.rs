// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Handover threads against a pipeline daemon that accepts but never answers.
// Kept to a single test so the thread count is not disturbed by siblings.

use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camd::pipeline::{handover_with_timeout, Artifact, UnixSocketPipeline};
use camd::CamdError;

fn thread_count() -> usize {
    std::fs::read_dir("/proc/self/task").unwrap().count()
}

fn artifact(n: u64) -> Artifact {
    Artifact {
        path: PathBuf::from(format!("/tmp/silent-{n:08}.fits")),
        camera_id: "silent".into(),
        frame_counter: n,
        shutter_counter: n,
    }
}

#[test]
fn timed_out_handovers_do_not_leave_threads_behind() {
    let dir = tempfile::tempdir().unwrap();
    let sock = dir.path().join("pipeline.sock");
    let listener = UnixListener::bind(&sock).unwrap();
    thread::spawn(move || {
        let mut held: Vec<UnixStream> = Vec::new();
        for stream in listener.incoming() {
            match stream {
                Ok(s) => held.push(s),
                Err(_) => break,
            }
        }
    });
    thread::sleep(Duration::from_millis(50));
    let baseline = thread_count();

    let timeout = Duration::from_millis(50);
    let pipeline = Arc::new(UnixSocketPipeline::new(&sock, timeout));
    for n in 1..=20 {
        let err = handover_with_timeout(pipeline.clone(), artifact(n), timeout).unwrap_err();
        assert!(matches!(err, CamdError::Handover(_)));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    while thread_count() > baseline && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(thread_count(), baseline);
}
