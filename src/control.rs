// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// JSON-line TCP control surface for the dispatcher.
//
// One request per line: {"method": "set_exposure", "params": {"seconds": 5}}
// One reply per line:   {"status": "Succeeded"} (plus "data" for status).

use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::protocol::{CommandStatus, ConfigureParams, ReadoutMode, StatusReport};

const ACCEPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
struct ControlRequest {
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ControlResponse {
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<StatusReport>,
}

impl From<CommandStatus> for ControlResponse {
    fn from(status: CommandStatus) -> Self {
        Self { status, data: None }
    }
}

#[derive(Deserialize)]
struct CoolingParams {
    enabled: bool,
}

#[derive(Deserialize)]
struct ExposureParams {
    seconds: f64,
}

#[derive(Deserialize)]
struct WindowParams {
    #[serde(default)]
    window: Option<[u32; 4]>,
}

#[derive(Deserialize)]
struct BinningParams {
    #[serde(default)]
    binning: Option<[u32; 2]>,
}

#[derive(Deserialize)]
struct ModeParams {
    #[serde(default)]
    mode: Option<ReadoutMode>,
}

#[derive(Deserialize)]
struct StartParams {
    #[serde(default)]
    count: u32,
}

fn params<T: DeserializeOwned>(value: serde_json::Value) -> std::result::Result<T, CommandStatus> {
    let value = if value.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        value
    };
    serde_json::from_value(value).map_err(|e| {
        tracing::debug!("bad control parameters: {e}");
        CommandStatus::InvalidArgument
    })
}

/// Execute one request line on behalf of `caller`.
pub fn handle_line(d: &Dispatcher, caller: IpAddr, line: &str) -> ControlResponse {
    let req: ControlRequest = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(%caller, "malformed control request: {e}");
            return CommandStatus::InvalidArgument.into();
        }
    };
    let p = req.params;
    let status = match req.method.as_str() {
        "initialize" => d.initialize(caller),
        "shutdown" => d.shutdown(caller),
        "set_cooling" => match params::<CoolingParams>(p) {
            Ok(p) => d.set_cooling(caller, p.enabled),
            Err(s) => s,
        },
        "set_exposure" => match params::<ExposureParams>(p) {
            Ok(p) => d.set_exposure(caller, p.seconds),
            Err(s) => s,
        },
        "set_window" => match params::<WindowParams>(p) {
            Ok(p) => d.set_window(caller, p.window),
            Err(s) => s,
        },
        "set_binning" => match params::<BinningParams>(p) {
            Ok(p) => d.set_binning(caller, p.binning),
            Err(s) => s,
        },
        "set_mode" => match params::<ModeParams>(p) {
            Ok(p) => d.set_mode(caller, p.mode),
            Err(s) => s,
        },
        "configure" => match params::<ConfigureParams>(p) {
            Ok(p) => d.configure(caller, &p),
            Err(s) => s,
        },
        "start_sequence" => match params::<StartParams>(p) {
            Ok(p) => d.start_sequence(caller, p.count),
            Err(s) => s,
        },
        "stop_sequence" => d.stop_sequence(caller),
        "report_status" => {
            return match d.report_status(caller) {
                Ok(report) => ControlResponse {
                    status: CommandStatus::Succeeded,
                    data: Some(report),
                },
                Err(status) => status.into(),
            }
        }
        other => {
            tracing::debug!(%caller, method = other, "unknown control method");
            CommandStatus::InvalidArgument
        }
    };
    status.into()
}

fn serve_client(d: &Dispatcher, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let resp = handle_line(d, peer.ip(), &line);
        let mut out = serde_json::to_vec(&resp)?;
        out.push(b'\n');
        writer.write_all(&out)?;
    }
    Ok(())
}

/// Accept control connections until `quit` is set. Each client gets its own
/// thread, so a slow command never holds up `stop_sequence` or status.
pub fn serve(listener: TcpListener, d: Arc<Dispatcher>, quit: &AtomicBool) -> Result<()> {
    listener.set_nonblocking(true)?;
    tracing::info!(addr = %listener.local_addr()?, "control surface listening");
    while !quit.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                let d = Arc::clone(&d);
                std::thread::Builder::new()
                    .name(format!("control-{peer}"))
                    .spawn(move || {
                        tracing::debug!(%peer, "control client connected");
                        if let Err(e) = serve_client(&d, stream, peer) {
                            tracing::debug!(%peer, "control client dropped: {e}");
                        }
                    })?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
