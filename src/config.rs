// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Daemon configuration, read once at startup from a TOML file.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CamdError, Result};
use crate::frame_pool::{PoolGeometry, FRAME_HEADER_LEN};
use crate::protocol::ReadoutMode;
use crate::shm_name::frame_pool_name;

/// Settings for the simulated sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulatedConfig {
    pub width: u32,
    pub height: u32,
    /// Seconds spent reading out each frame.
    pub readout_time: f64,
    /// Hang instead of closing on `shutdown`.
    pub ignore_shutdown: bool,
    /// Report the camera as missing when opened.
    pub fail_open: bool,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            readout_time: 0.05,
            ignore_shutdown: false,
            fail_open: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub camera_id: String,
    pub camera_serial: String,

    /// Addresses allowed to issue control commands.
    #[serde(default = "default_control_ips")]
    pub control_ips: Vec<IpAddr>,
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Frame pool segment name; derived from `camera_id` when absent.
    #[serde(default)]
    pub shm_name: Option<String>,
    /// Frame pool region size; defaults to four slots.
    #[serde(default)]
    pub framebuffer_bytes: Option<usize>,
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_output_path")]
    pub output_path: PathBuf,
    #[serde(default = "default_counter_path")]
    pub counter_path: PathBuf,
    #[serde(default)]
    pub pipeline_socket: Option<PathBuf>,
    #[serde(default = "default_handover_timeout")]
    pub pipeline_handover_timeout: f64,

    #[serde(default = "default_command_timeout")]
    pub command_timeout: f64,
    #[serde(default = "default_initialize_timeout")]
    pub initialize_timeout: f64,

    #[serde(default = "default_binning")]
    pub binning: [u32; 2],
    #[serde(default)]
    pub mode: ReadoutMode,
    #[serde(default = "default_setpoint")]
    pub temperature_setpoint: f64,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default = "default_header_cards")]
    pub header_card_capacity: usize,

    #[serde(default)]
    pub driver_executable: Option<PathBuf>,
    #[serde(default)]
    pub output_executable: Option<PathBuf>,

    #[serde(default)]
    pub simulated: SimulatedConfig,
}

fn default_control_ips() -> Vec<IpAddr> {
    vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]
}
fn default_listen() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 9030))
}
fn default_workers() -> usize {
    2
}
fn default_output_path() -> PathBuf {
    std::env::temp_dir().join("camd")
}
fn default_counter_path() -> PathBuf {
    PathBuf::from("camd-counters.json")
}
fn default_handover_timeout() -> f64 {
    10.0
}
fn default_command_timeout() -> f64 {
    5.0
}
fn default_initialize_timeout() -> f64 {
    30.0
}
fn default_binning() -> [u32; 2] {
    [1, 1]
}
fn default_setpoint() -> f64 {
    -20.0
}
fn default_header_cards() -> usize {
    144
}

impl Config {
    /// Minimal configuration with every optional field at its default.
    pub fn new(camera_id: &str, camera_serial: &str) -> Self {
        Self {
            camera_id: camera_id.to_owned(),
            camera_serial: camera_serial.to_owned(),
            control_ips: default_control_ips(),
            listen: default_listen(),
            shm_name: None,
            framebuffer_bytes: None,
            workers: default_workers(),
            output_path: default_output_path(),
            counter_path: default_counter_path(),
            pipeline_socket: None,
            pipeline_handover_timeout: default_handover_timeout(),
            command_timeout: default_command_timeout(),
            initialize_timeout: default_initialize_timeout(),
            binning: default_binning(),
            mode: ReadoutMode::default(),
            temperature_setpoint: default_setpoint(),
            filter: None,
            header_card_capacity: default_header_cards(),
            driver_executable: None,
            output_executable: None,
            simulated: SimulatedConfig::default(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CamdError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera_id.is_empty() {
            return Err(CamdError::Config("camera_id must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(CamdError::Config("workers must be at least 1".into()));
        }
        if self.simulated.width == 0 || self.simulated.height == 0 {
            return Err(CamdError::Config("sensor dimensions must be non-zero".into()));
        }
        if self.binning.iter().any(|&b| b == 0) {
            return Err(CamdError::Config("binning factors must be at least 1".into()));
        }
        for (name, secs) in [
            ("pipeline_handover_timeout", self.pipeline_handover_timeout),
            ("command_timeout", self.command_timeout),
            ("initialize_timeout", self.initialize_timeout),
        ] {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(CamdError::Config(format!("{name} must be positive")));
            }
        }
        if self.framebuffer_bytes() < self.slot_size() {
            return Err(CamdError::Config(format!(
                "framebuffer_bytes ({}) cannot hold one {}-byte frame slot",
                self.framebuffer_bytes(),
                self.slot_size()
            )));
        }
        Ok(())
    }

    /// Bytes of raw 16-bit pixel data in a full-sensor frame.
    pub fn frame_bytes(&self) -> usize {
        self.simulated.width as usize * self.simulated.height as usize * 2
    }

    /// One frame plus its metadata header.
    pub fn slot_size(&self) -> usize {
        FRAME_HEADER_LEN + self.frame_bytes()
    }

    pub fn framebuffer_bytes(&self) -> usize {
        self.framebuffer_bytes.unwrap_or(4 * self.slot_size())
    }

    pub fn pool_geometry(&self) -> Result<PoolGeometry> {
        PoolGeometry::from_region(self.framebuffer_bytes(), self.slot_size())
    }

    pub fn pool_name(&self) -> String {
        self.shm_name
            .clone()
            .unwrap_or_else(|| frame_pool_name(&self.camera_id))
    }

    pub fn is_control_ip(&self, ip: IpAddr) -> bool {
        self.control_ips.contains(&ip)
    }

    pub fn handover_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.pipeline_handover_timeout)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout)
    }

    pub fn initialize_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.initialize_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_takes_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            camera_id = "cam1"
            camera_serial = "SN-42"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.binning, [1, 1]);
        assert_eq!(cfg.mode, ReadoutMode::LowNoise);
        assert_eq!(cfg.pool_name(), "camd_cam1_frames");
        assert_eq!(cfg.pool_geometry().unwrap().slot_count, 4);
        assert!(cfg.is_control_ip("127.0.0.1".parse().unwrap()));
        assert!(!cfg.is_control_ip("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn simulated_section_and_timeouts_parse() {
        let cfg = Config::from_toml_str(
            r#"
            camera_id = "cam1"
            camera_serial = "SN-42"
            control_ips = ["10.2.0.5"]
            pipeline_handover_timeout = 0.5
            mode = "high_speed"

            [simulated]
            width = 64
            height = 32
            ignore_shutdown = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.frame_bytes(), 64 * 32 * 2);
        assert!(cfg.simulated.ignore_shutdown);
        assert_eq!(cfg.mode, ReadoutMode::HighSpeed);
        assert_eq!(cfg.handover_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = Config::from_toml_str(
            r#"
            camera_id = "cam1"
            camera_serial = "SN-42"
            workers = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, CamdError::Config(_)));
    }

    #[test]
    fn framebuffer_smaller_than_a_slot_is_rejected() {
        let mut cfg = Config::new("cam1", "SN-42");
        cfg.framebuffer_bytes = Some(16);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::from_toml_str("camera_id = \"a\"\ncamera_serial = \"b\"\nbogus = 1\n").is_err());
    }
}
