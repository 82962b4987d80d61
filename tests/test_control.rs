// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// JSON-line control surface in front of the dispatcher.

use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camd::control::{self, handle_line, ControlResponse};
use camd::{CameraState, CommandStatus, Config, Dispatcher, FramePool, ReadoutMode};

static COUNTER: AtomicUsize = AtomicUsize::new(0);

fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_ctl_{n}_{}", std::process::id())
}

const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const STRANGER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7));

struct Harness {
    _dir: tempfile::TempDir,
    dispatcher: Arc<Dispatcher>,
}

impl Harness {
    fn new(prefix: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = Config::new("ctlcam", "SN-3");
        cfg.shm_name = Some(unique_name(prefix));
        cfg.simulated.width = 32;
        cfg.simulated.height = 16;
        cfg.output_path = dir.path().join("frames");
        cfg.counter_path = dir.path().join("counters.json");
        cfg.driver_executable = Some(PathBuf::from(env!("CARGO_BIN_EXE_camd-driver")));
        let pool = Arc::new(FramePool::create(&cfg.pool_name(), cfg.pool_geometry().unwrap()).unwrap());
        let dispatcher = Dispatcher::new(cfg, pool)
            .unwrap()
            .with_shutdown_timeout(Duration::from_millis(1500));
        Self {
            _dir: dir,
            dispatcher: Arc::new(dispatcher),
        }
    }

    fn call(&self, caller: IpAddr, line: &str) -> ControlResponse {
        handle_line(&self.dispatcher, caller, line)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.dispatcher.close();
        self.dispatcher.pool().unlink();
    }
}

#[test]
fn unauthorized_caller_is_refused_for_every_method() {
    let h = Harness::new("unauth");
    for line in [
        r#"{"method": "initialize"}"#,
        r#"{"method": "set_exposure", "params": {"seconds": 1}}"#,
        r#"{"method": "report_status"}"#,
    ] {
        assert_eq!(h.call(STRANGER, line).status, CommandStatus::InvalidControlIp, "{line}");
    }
}

#[test]
fn malformed_requests_are_invalid_arguments() {
    let h = Harness::new("malformed");
    for line in [
        "not json",
        r#"{"params": {}}"#,
        r#"{"method": "teleport"}"#,
        r#"{"method": "set_exposure", "params": {"seconds": "long"}}"#,
        r#"{"method": "configure", "params": {"gain": 4}}"#,
    ] {
        assert_eq!(h.call(LOCAL, line).status, CommandStatus::InvalidArgument, "{line}");
    }
}

#[test]
fn commands_before_initialize_report_not_initialized() {
    let h = Harness::new("uninit");
    let resp = h.call(LOCAL, r#"{"method": "set_cooling", "params": {"enabled": true}}"#);
    assert_eq!(resp.status, CommandStatus::CameraNotInitialized);
    assert_eq!(h.call(LOCAL, r#"{"method": "shutdown"}"#).status, CommandStatus::CameraNotInitialized);

    let status = h.call(LOCAL, r#"{"method": "report_status"}"#);
    assert_eq!(status.status, CommandStatus::Succeeded);
    assert_eq!(status.data.unwrap().state, CameraState::Disabled);
}

#[test]
fn configure_and_report_through_json() {
    let h = Harness::new("configure");
    assert_eq!(h.call(LOCAL, r#"{"method": "initialize"}"#).status, CommandStatus::Succeeded);

    let resp = h.call(
        LOCAL,
        r#"{"method": "configure", "params": {"exposure": 2.5, "bin": [2, 2], "mode": "high_speed"}}"#,
    );
    assert_eq!(resp, ControlResponse::from(CommandStatus::Succeeded));

    let report = h.call(LOCAL, r#"{"method": "report_status"}"#).data.unwrap();
    assert_eq!(report.state, CameraState::Idle);
    assert_eq!(report.exposure_time, 2.5);
    assert_eq!(report.binning, [2, 2]);
    assert_eq!(report.mode, ReadoutMode::HighSpeed);
    assert_eq!(report.window, [0, 31, 0, 15]);

    let resp = h.call(LOCAL, r#"{"method": "set_window", "params": {"window": [0, 40, 0, 3]}}"#);
    assert_eq!(resp.status, CommandStatus::WindowOutsideSensor);

    assert_eq!(h.call(LOCAL, r#"{"method": "shutdown"}"#).status, CommandStatus::Succeeded);
}

#[test]
fn tcp_clients_are_served_until_quit() {
    let h = Harness::new("tcp");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let quit = Arc::new(AtomicBool::new(false));

    let server = {
        let d = Arc::clone(&h.dispatcher);
        let quit = Arc::clone(&quit);
        thread::spawn(move || control::serve(listener, d, &quit))
    };

    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    let mut roundtrip = |line: &str| -> serde_json::Value {
        writer.write_all(line.as_bytes()).unwrap();
        writer.write_all(b"\n").unwrap();
        let mut reply = String::new();
        reader.read_line(&mut reply).unwrap();
        serde_json::from_str(&reply).unwrap()
    };

    let status = roundtrip(r#"{"method": "report_status"}"#);
    assert_eq!(status["status"], "Succeeded");
    assert_eq!(status["data"]["state"], "Disabled");

    let reply = roundtrip(r#"{"method": "stop_sequence"}"#);
    assert_eq!(reply["status"], "CameraNotInitialized");
    assert!(reply.get("data").is_none());

    quit.store(true, Ordering::Release);
    server.join().unwrap().unwrap();
}
