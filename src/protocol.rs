// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Messages exchanged between the dispatcher and the driver process, and the
// status vocabulary shared with callers.
//
// Frames on the private duplex channel are a 4-byte little-endian length
// followed by that many bytes of JSON.

use std::fmt;
use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CamdError, Result};

/// Upper bound on a single channel frame.
pub const MAX_FRAME_LEN: usize = 1 << 20;

// ---------------------------------------------------------------------------
// Status codes
// ---------------------------------------------------------------------------

/// Result of a control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandStatus {
    Succeeded,
    Failed,
    Blocked,
    #[serde(rename = "InvalidControlIP")]
    InvalidControlIp,
    CameraNotInitialized,
    CameraNotUninitialized,
    CameraNotFound,
    CameraNotIdle,
    CameraNotAcquiring,
    WindowOutsideSensor,
    InvalidArgument,
}

impl CommandStatus {
    pub fn is_success(self) -> bool {
        self == CommandStatus::Succeeded
    }

    /// Human-readable description for logs and the control surface.
    pub fn message(self) -> &'static str {
        match self {
            CommandStatus::Succeeded => "command succeeded",
            CommandStatus::Failed => "command failed",
            CommandStatus::Blocked => "another command is already running",
            CommandStatus::InvalidControlIp => "command not accepted from this IP",
            CommandStatus::CameraNotInitialized => "camera has not been initialized",
            CommandStatus::CameraNotUninitialized => "camera has already been initialized",
            CommandStatus::CameraNotFound => "camera hardware not found",
            CommandStatus::CameraNotIdle => "camera is not idle",
            CommandStatus::CameraNotAcquiring => "camera is not acquiring",
            CommandStatus::WindowOutsideSensor => "window extends outside sensor",
            CommandStatus::InvalidArgument => "invalid command argument",
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

// ---------------------------------------------------------------------------
// Camera state
// ---------------------------------------------------------------------------

/// Camera state as seen through `report_status`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CameraState {
    /// No live driver process.
    #[default]
    Disabled,
    /// `initialize` is starting a driver process.
    Initializing,
    Idle,
    /// Single-frame run, shutter open.
    Exposing,
    /// Exposure time elapsed; waiting on readout or a free frame slot.
    Reading,
    /// Multi-frame or continuous run, shutter open.
    Sequencing,
    /// Stop requested, acquisition winding down.
    Aborting,
}

impl CameraState {
    /// A sequence or single exposure is in progress.
    pub fn is_acquiring(self) -> bool {
        matches!(
            self,
            CameraState::Exposing | CameraState::Reading | CameraState::Sequencing | CameraState::Aborting
        )
    }
}

/// Sensor readout mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadoutMode {
    HighSpeed,
    #[default]
    LowNoise,
    HighDynamicRange,
}

impl ReadoutMode {
    /// Identifier written into artifact headers.
    pub fn as_str(self) -> &'static str {
        match self {
            ReadoutMode::HighSpeed => "high_speed",
            ReadoutMode::LowNoise => "low_noise",
            ReadoutMode::HighDynamicRange => "high_dynamic_range",
        }
    }

    pub(crate) fn to_raw(self) -> u32 {
        match self {
            ReadoutMode::HighSpeed => 0,
            ReadoutMode::LowNoise => 1,
            ReadoutMode::HighDynamicRange => 2,
        }
    }

    pub(crate) fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(ReadoutMode::HighSpeed),
            1 => Some(ReadoutMode::LowNoise),
            2 => Some(ReadoutMode::HighDynamicRange),
            _ => None,
        }
    }
}

/// Snapshot returned by the `status` command.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: CameraState,
    #[serde(default)]
    pub cooler_enabled: bool,
    #[serde(default)]
    pub cooler_temperature: f64,
    #[serde(default)]
    pub cooler_setpoint: f64,
    #[serde(default)]
    pub temperature_locked: bool,
    #[serde(default)]
    pub exposure_time: f64,
    #[serde(default)]
    pub exposure_progress: f64,
    /// 0-indexed inclusive `[x1, x2, y1, y2]` in unbinned detector pixels.
    #[serde(default)]
    pub window: [u32; 4],
    #[serde(default)]
    pub binning: [u32; 2],
    #[serde(default)]
    pub mode: ReadoutMode,
    #[serde(default)]
    pub sequence_frame_limit: u32,
    #[serde(default)]
    pub sequence_frame_count: u32,
}

impl StatusReport {
    /// Report used whenever no driver process is alive.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_state(state: CameraState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Command messages
// ---------------------------------------------------------------------------

/// A command forwarded to the driver process: `{"command": name, "args": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum Command {
    Cooling {
        enabled: bool,
        #[serde(default)]
        quiet: bool,
    },
    Exposure {
        seconds: f64,
        #[serde(default)]
        quiet: bool,
    },
    /// 1-indexed inclusive `[x1, x2, y1, y2]`; `None` restores the full sensor.
    Window {
        window: Option<[u32; 4]>,
        #[serde(default)]
        quiet: bool,
    },
    /// `None` restores the configured default.
    Binning {
        binning: Option<[u32; 2]>,
        #[serde(default)]
        quiet: bool,
    },
    /// `None` restores the configured default.
    Mode {
        mode: Option<ReadoutMode>,
        #[serde(default)]
        quiet: bool,
    },
    /// `count == 0` runs until stopped.
    Start {
        count: u32,
        #[serde(default)]
        quiet: bool,
    },
    Stop {
        #[serde(default)]
        quiet: bool,
    },
    Status,
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Cooling { .. } => "cooling",
            Command::Exposure { .. } => "exposure",
            Command::Window { .. } => "window",
            Command::Binning { .. } => "binning",
            Command::Mode { .. } => "mode",
            Command::Start { .. } => "start",
            Command::Stop { .. } => "stop",
            Command::Status => "status",
            Command::Shutdown => "shutdown",
        }
    }
}

/// Reply to a [`Command`]: a bare status, or a report for `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Status(CommandStatus),
    Report(StatusReport),
}

impl Reply {
    /// Status carried by the reply; a report counts as success.
    pub fn status(&self) -> CommandStatus {
        match self {
            Reply::Status(s) => *s,
            Reply::Report(_) => CommandStatus::Succeeded,
        }
    }
}

/// Dispatcher → driver envelope. `seq` is echoed in the matching [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: u64,
    pub message: Command,
}

/// Driver → dispatcher envelope. The init handshake uses `seq == 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub seq: u64,
    pub reply: Reply,
}

/// Parameters accepted by `configure`. Absent keys take their defaults.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigureParams {
    pub cooling: Option<bool>,
    pub exposure: Option<f64>,
    pub window: Option<[u32; 4]>,
    pub bin: Option<[u32; 2]>,
    pub mode: Option<ReadoutMode>,
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Serialize `msg` as one length-prefixed frame and flush.
pub fn write_frame<W: Write, T: Serialize>(w: &mut W, msg: &T) -> Result<()> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(CamdError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(&body)?;
    w.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed the stream cleanly
/// between frames.
pub fn read_frame<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    let mut got = 0;
    while got < len_buf.len() {
        match r.read(&mut len_buf[got..]) {
            Ok(0) if got == 0 => return Ok(None),
            Ok(0) => {
                return Err(CamdError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed inside frame header",
                )))
            }
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(CamdError::Protocol(format!("frame length {len} exceeds limit")));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body)?;
    Ok(Some(serde_json::from_slice(&body)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_wire_shape_is_name_plus_args() {
        let v = serde_json::to_value(Command::Exposure {
            seconds: 5.0,
            quiet: false,
        })
        .unwrap();
        assert_eq!(v["command"], "exposure");
        assert_eq!(v["args"]["seconds"], 5.0);

        let v = serde_json::to_value(Command::Status).unwrap();
        assert_eq!(v["command"], "status");
    }

    #[test]
    fn status_serializes_invalid_control_ip_name() {
        let s = serde_json::to_string(&CommandStatus::InvalidControlIp).unwrap();
        assert_eq!(s, "\"InvalidControlIP\"");
    }

    #[test]
    fn frame_roundtrip_through_buffer() {
        let req = Request {
            seq: 7,
            message: Command::Window {
                window: Some([1, 100, 1, 50]),
                quiet: true,
            },
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &req).unwrap();
        assert_eq!(&buf[..4], &((buf.len() - 4) as u32).to_le_bytes());

        let mut cursor = io::Cursor::new(buf);
        let back: Option<Request> = read_frame(&mut cursor).unwrap();
        assert_eq!(back, Some(req));
        let eof: Option<Request> = read_frame(&mut cursor).unwrap();
        assert!(eof.is_none());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Response {
            seq: 1,
            reply: Reply::Status(CommandStatus::Succeeded),
        })
        .unwrap();
        buf.truncate(buf.len() - 2);
        let res: Result<Option<Response>> = read_frame(&mut io::Cursor::new(buf));
        assert!(res.is_err());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut buf = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes().to_vec();
        buf.extend_from_slice(b"{}");
        let res: Result<Option<Response>> = read_frame(&mut io::Cursor::new(buf));
        assert!(matches!(res, Err(CamdError::Protocol(_))));
    }

    #[test]
    fn configure_params_reject_unknown_keys() {
        let ok: ConfigureParams =
            serde_json::from_str(r#"{"exposure": 10, "bin": [2, 2]}"#).unwrap();
        assert_eq!(ok.exposure, Some(10.0));
        assert_eq!(ok.bin, Some([2, 2]));
        assert!(ok.window.is_none());

        let bad: std::result::Result<ConfigureParams, _> =
            serde_json::from_str(r#"{"gain": 3}"#);
        assert!(bad.is_err());
    }
}
