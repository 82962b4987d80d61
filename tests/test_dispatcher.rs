// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Dispatcher lifecycle against the real `camd-driver` executable.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camd::counters::ShutterCounters;
use camd::{
    CameraState, CommandStatus, Config, ConfigureParams, DaemonState, Dispatcher, FramePool,
    ReadoutMode,
};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_disp_{n}_{}", std::process::id())
}

const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const STRANGER: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 9, 8, 7));

struct Harness {
    dispatcher: Arc<Dispatcher>,
    counter_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    fn new(prefix: &str, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::new("testcam", "SN-0001");
        cfg.shm_name = Some(unique_name(prefix));
        cfg.simulated.width = 32;
        cfg.simulated.height = 16;
        cfg.simulated.readout_time = 0.0;
        cfg.counter_path = dir.path().join("counters.json");
        cfg.output_path = dir.path().join("out");
        cfg.driver_executable = Some(PathBuf::from(env!("CARGO_BIN_EXE_camd-driver")));
        cfg.command_timeout = 5.0;
        cfg.initialize_timeout = 10.0;
        tweak(&mut cfg);
        cfg.validate().unwrap();

        let pool = FramePool::create(&cfg.pool_name(), cfg.pool_geometry().unwrap()).unwrap();
        let counter_path = cfg.counter_path.clone();
        let dispatcher = Dispatcher::new(cfg, Arc::new(pool))
            .unwrap()
            .with_shutdown_timeout(Duration::from_millis(1500));
        Self {
            dispatcher: Arc::new(dispatcher),
            counter_path,
            _dir: dir,
        }
    }

    fn status(&self) -> camd::StatusReport {
        self.dispatcher.report_status(LOCAL).unwrap()
    }

    fn wait_for_state(&self, state: CameraState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.status().state == state {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.dispatcher.close();
        self.dispatcher.pool().unlink();
    }
}

fn pid_exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[test]
fn initialize_twice_is_rejected() {
    let h = Harness::new("init_twice", |_| {});
    let d = &h.dispatcher;
    assert_eq!(d.initialize(LOCAL), CommandStatus::Succeeded);
    assert_eq!(d.daemon_state(), DaemonState::Ready);
    assert_eq!(d.initialize(LOCAL), CommandStatus::CameraNotUninitialized);
    assert_eq!(h.status().state, CameraState::Idle);

    assert_eq!(d.shutdown(LOCAL), CommandStatus::Succeeded);
    assert_eq!(d.shutdown(LOCAL), CommandStatus::CameraNotInitialized);
    assert_eq!(d.daemon_state(), DaemonState::Uninitialized);
}

#[test]
fn commands_without_driver_report_not_initialized() {
    let h = Harness::new("no_driver", |_| {});
    let d = &h.dispatcher;
    assert_eq!(d.set_exposure(LOCAL, 5.0), CommandStatus::CameraNotInitialized);
    assert_eq!(d.start_sequence(LOCAL, 1), CommandStatus::CameraNotInitialized);
    assert_eq!(d.stop_sequence(LOCAL), CommandStatus::CameraNotInitialized);
    assert_eq!(h.status().state, CameraState::Disabled);
}

#[test]
fn unauthorized_callers_are_rejected() {
    let h = Harness::new("unauthorized", |_| {});
    let d = &h.dispatcher;
    assert_eq!(d.initialize(STRANGER), CommandStatus::InvalidControlIp);
    assert_eq!(d.stop_sequence(STRANGER), CommandStatus::InvalidControlIp);
    assert_eq!(d.report_status(STRANGER), Err(CommandStatus::InvalidControlIp));
    assert_eq!(d.supervisor_pid(), None);
}

#[test]
fn configure_applies_values_and_defaults() {
    let h = Harness::new("configure", |_| {});
    let d = &h.dispatcher;
    assert_eq!(d.initialize(LOCAL), CommandStatus::Succeeded);
    assert_eq!(d.set_mode(LOCAL, Some(ReadoutMode::HighSpeed)), CommandStatus::Succeeded);

    let params = ConfigureParams {
        exposure: Some(10.0),
        bin: Some([2, 2]),
        ..ConfigureParams::default()
    };
    assert_eq!(d.configure(LOCAL, &params), CommandStatus::Succeeded);

    let s = h.status();
    assert_eq!(s.exposure_time, 10.0);
    assert_eq!(s.binning, [2, 2]);
    assert!(s.cooler_enabled);
    assert_eq!(s.window, [0, 31, 0, 15]);
    assert_eq!(s.mode, ReadoutMode::LowNoise);
}

#[test]
fn configure_continues_past_a_failing_step() {
    let h = Harness::new("configure_fail", |_| {});
    let d = &h.dispatcher;
    assert_eq!(d.initialize(LOCAL), CommandStatus::Succeeded);

    let params = ConfigureParams {
        exposure: Some(3.0),
        window: Some([1, 64, 1, 16]),
        bin: Some([4, 2]),
        ..ConfigureParams::default()
    };
    assert_eq!(d.configure(LOCAL, &params), CommandStatus::WindowOutsideSensor);
    let s = h.status();
    assert_eq!(s.exposure_time, 3.0);
    assert_eq!(s.binning, [4, 2]);
}

#[test]
fn window_is_validated_and_reset() {
    let h = Harness::new("window", |_| {});
    let d = &h.dispatcher;
    assert_eq!(d.initialize(LOCAL), CommandStatus::Succeeded);
    assert_eq!(d.set_window(LOCAL, Some([2, 10, 3, 8])), CommandStatus::Succeeded);
    assert_eq!(h.status().window, [1, 9, 2, 7]);
    assert_eq!(d.set_window(LOCAL, Some([0, 10, 1, 8])), CommandStatus::WindowOutsideSensor);
    assert_eq!(d.set_window(LOCAL, Some([1, 33, 1, 8])), CommandStatus::WindowOutsideSensor);
    assert_eq!(d.set_window(LOCAL, None), CommandStatus::Succeeded);
    assert_eq!(h.status().window, [0, 31, 0, 15]);
}

#[test]
fn report_status_is_idempotent() {
    let h = Harness::new("idempotent", |_| {});
    let d = &h.dispatcher;
    assert_eq!(h.status(), h.status());
    assert_eq!(d.initialize(LOCAL), CommandStatus::Succeeded);
    assert_eq!(d.set_cooling(LOCAL, true), CommandStatus::Succeeded);
    let first = h.status();
    assert_eq!(first, h.status());
    assert!(first.temperature_locked);
}

#[test]
fn sequence_fills_slots_and_counts_exposures() {
    let h = Harness::new("sequence", |_| {});
    let d = &h.dispatcher;
    assert_eq!(d.initialize(LOCAL), CommandStatus::Succeeded);
    assert_eq!(d.set_exposure(LOCAL, 0.3), CommandStatus::Succeeded);
    assert_eq!(d.start_sequence(LOCAL, 2), CommandStatus::Succeeded);
    assert_eq!(d.daemon_state(), DaemonState::Busy);
    assert_eq!(d.set_exposure(LOCAL, 1.0), CommandStatus::CameraNotIdle);

    assert!(h.wait_for_state(CameraState::Idle, Duration::from_secs(10)));
    assert_eq!(d.daemon_state(), DaemonState::Ready);
    let s = h.status();
    assert_eq!(s.sequence_frame_count, 2);
    assert_eq!(s.sequence_frame_limit, 2);

    // No output workers: both frames wait in the work queue.
    let acc = d.pool().accounting().unwrap();
    assert_eq!((acc.work, acc.free), (2, acc.total - 2));

    assert_eq!(d.stop_sequence(LOCAL), CommandStatus::CameraNotAcquiring);
    assert_eq!(d.shutdown(LOCAL), CommandStatus::Succeeded);
    assert_eq!(ShutterCounters::load(&h.counter_path).unwrap().exposure_count, 2);

    // Reconciled on shutdown, rebuilt on the next initialize.
    let acc = d.pool().accounting().unwrap();
    assert_eq!((acc.work, acc.free), (0, 0));
    assert_eq!(d.initialize(LOCAL), CommandStatus::Succeeded);
    assert_eq!(d.pool().free_len().unwrap(), acc.total);
}

#[test]
fn stop_interrupts_a_backpressured_sequence() {
    let h = Harness::new("stop", |_| {});
    let d = &h.dispatcher;
    assert_eq!(d.initialize(LOCAL), CommandStatus::Succeeded);
    assert_eq!(d.set_exposure(LOCAL, 0.0), CommandStatus::Succeeded);
    assert_eq!(d.start_sequence(LOCAL, 0), CommandStatus::Succeeded);
    assert_eq!(d.start_sequence(LOCAL, 1), CommandStatus::CameraNotIdle);

    // Every slot ends up in the work queue; the driver then waits for one.
    let total = d.pool().slot_count();
    let deadline = Instant::now() + Duration::from_secs(10);
    while d.pool().work_len().unwrap() < total && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(h.wait_for_state(CameraState::Reading, Duration::from_secs(5)));

    assert_eq!(d.daemon_state(), DaemonState::Busy);
    assert_eq!(d.stop_sequence(LOCAL), CommandStatus::Succeeded);
    assert_eq!(h.status().state, CameraState::Idle);
    assert_eq!(d.daemon_state(), DaemonState::Ready);
    assert_eq!(h.status().sequence_frame_count as usize, total);
}

#[test]
fn contention_returns_blocked_immediately() {
    let h = Harness::new("blocked", |c| c.simulated.ignore_shutdown = true);
    let d = Arc::clone(&h.dispatcher);
    assert_eq!(d.initialize(LOCAL), CommandStatus::Succeeded);

    // A shutdown against a hung driver holds the serialization right for the
    // whole join bound.
    let slow = {
        let d = Arc::clone(&d);
        thread::spawn(move || d.shutdown(LOCAL))
    };
    thread::sleep(Duration::from_millis(300));

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let d = Arc::clone(&d);
            thread::spawn(move || {
                let t0 = Instant::now();
                (d.set_exposure(LOCAL, 2.0), t0.elapsed())
            })
        })
        .collect();
    for c in callers {
        let (status, took) = c.join().unwrap();
        assert_eq!(status, CommandStatus::Blocked);
        assert!(took < Duration::from_millis(200));
    }
    assert_eq!(slow.join().unwrap(), CommandStatus::Succeeded);
}

#[test]
fn hung_driver_is_killed_on_shutdown() {
    let h = Harness::new("forced", |c| c.simulated.ignore_shutdown = true);
    let d = &h.dispatcher;
    assert_eq!(d.initialize(LOCAL), CommandStatus::Succeeded);
    let pid = d.supervisor_pid().unwrap();

    let t0 = Instant::now();
    assert_eq!(d.shutdown(LOCAL), CommandStatus::Succeeded);
    assert!(t0.elapsed() >= Duration::from_millis(1500));
    assert!(!pid_exists(pid));
    assert_eq!(h.status().state, CameraState::Disabled);

    assert_eq!(d.initialize(LOCAL), CommandStatus::Succeeded);
    assert_eq!(d.pool().free_len().unwrap(), d.pool().slot_count());
}

#[test]
fn crashed_driver_is_detected_lazily() {
    let h = Harness::new("crash", |_| {});
    let d = &h.dispatcher;
    assert_eq!(d.initialize(LOCAL), CommandStatus::Succeeded);
    let pid = d.supervisor_pid().unwrap();
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
    thread::sleep(Duration::from_millis(200));

    assert_eq!(d.daemon_state(), DaemonState::Uninitialized);
    assert_eq!(d.set_exposure(LOCAL, 1.0), CommandStatus::CameraNotInitialized);
    assert_eq!(d.supervisor_pid(), None);
    assert_eq!(h.status().state, CameraState::Disabled);
    assert_eq!(d.initialize(LOCAL), CommandStatus::Succeeded);
    assert_eq!(h.status().state, CameraState::Idle);
}

#[test]
fn missing_camera_fails_initialize() {
    let h = Harness::new("not_found", |c| c.simulated.fail_open = true);
    let d = &h.dispatcher;
    assert_eq!(d.initialize(LOCAL), CommandStatus::CameraNotFound);
    assert_eq!(d.daemon_state(), DaemonState::Uninitialized);
    assert_eq!(d.supervisor_pid(), None);
    assert_eq!(h.status().state, CameraState::Disabled);
}
