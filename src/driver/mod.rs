// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Camera driver interface. Only the driver process talks to hardware.

pub mod simulated;

use std::time::Duration;

use crate::error::Result;
use crate::protocol::ReadoutMode;

pub use simulated::SimulatedCamera;

/// Sensor dimensions in unbinned pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorGeometry {
    pub width: u32,
    pub height: u32,
}

impl SensorGeometry {
    /// 0-indexed inclusive window covering the whole sensor.
    pub fn full_window(&self) -> [u32; 4] {
        [0, self.width - 1, 0, self.height - 1]
    }

    /// Bytes of one full-sensor 16-bit frame.
    pub fn frame_bytes(&self) -> usize {
        self.width as usize * self.height as usize * 2
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct CoolerStatus {
    pub enabled: bool,
    pub temperature: f64,
    pub setpoint: f64,
    pub locked: bool,
}

/// Vendor camera driver.
///
/// Exposure timing is owned by the caller: `begin_exposure` opens the
/// shutter, the caller waits (and may call `abort_exposure`), then
/// `read_frame` reads the sensor out. Calls are short so a status query can
/// interleave with a running sequence.
pub trait CameraDriver: Send {
    /// Open the camera with the given serial number.
    fn open(&mut self, serial: &str) -> Result<SensorGeometry>;

    /// Release the hardware.
    fn close(&mut self) -> Result<()>;

    fn set_cooling(&mut self, enabled: bool, setpoint: f64) -> Result<()>;

    fn cooler_status(&mut self) -> Result<CoolerStatus>;

    fn set_readout_mode(&mut self, mode: ReadoutMode) -> Result<()>;

    fn begin_exposure(&mut self, exposure: Duration) -> Result<()>;

    fn abort_exposure(&mut self) -> Result<()>;

    /// Read a full-sensor frame as little-endian `u16` pixels into `out`,
    /// which is exactly [`SensorGeometry::frame_bytes`] long.
    fn read_frame(&mut self, out: &mut [u8]) -> Result<()>;
}
