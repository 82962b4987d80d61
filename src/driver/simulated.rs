// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

use std::time::Duration;

use crate::config::SimulatedConfig;
use crate::driver::{CameraDriver, CoolerStatus, SensorGeometry};
use crate::error::{CamdError, Result};
use crate::protocol::ReadoutMode;

const AMBIENT_TEMPERATURE: f64 = 20.0;

/// A software sensor that produces a deterministic test pattern.
///
/// Pixel `(x, y)` of frame `n` is `1000 + (3x + 5y + n) % 1024`.
pub struct SimulatedCamera {
    settings: SimulatedConfig,
    geometry: Option<SensorGeometry>,
    cooler: CoolerStatus,
    mode: ReadoutMode,
    exposing: bool,
    frames_read: u64,
}

impl SimulatedCamera {
    pub fn new(settings: SimulatedConfig) -> Self {
        Self {
            settings,
            geometry: None,
            cooler: CoolerStatus {
                temperature: AMBIENT_TEMPERATURE,
                ..CoolerStatus::default()
            },
            mode: ReadoutMode::default(),
            exposing: false,
            frames_read: 0,
        }
    }

    /// Value the pattern holds at `(x, y)` of the `frame`-th readout (0-based).
    pub fn pattern(x: u32, y: u32, frame: u64) -> u16 {
        let v = (3 * x as u64 + 5 * y as u64 + frame) % 1024;
        1000 + v as u16
    }

    fn geometry(&self) -> Result<SensorGeometry> {
        self.geometry
            .ok_or_else(|| CamdError::Driver("camera is not open".into()))
    }
}

impl CameraDriver for SimulatedCamera {
    fn open(&mut self, serial: &str) -> Result<SensorGeometry> {
        if self.settings.fail_open {
            return Err(CamdError::Driver(format!("no camera with serial {serial}")));
        }
        let g = SensorGeometry {
            width: self.settings.width,
            height: self.settings.height,
        };
        self.geometry = Some(g);
        tracing::info!(serial, width = g.width, height = g.height, "opened simulated camera");
        Ok(g)
    }

    fn close(&mut self) -> Result<()> {
        if self.settings.ignore_shutdown {
            tracing::warn!("simulated camera hangs on close");
            loop {
                std::thread::sleep(Duration::from_secs(3600));
            }
        }
        self.geometry = None;
        self.exposing = false;
        Ok(())
    }

    fn set_cooling(&mut self, enabled: bool, setpoint: f64) -> Result<()> {
        self.geometry()?;
        self.cooler.enabled = enabled;
        self.cooler.setpoint = setpoint;
        // Cooling settles instantly.
        self.cooler.temperature = if enabled { setpoint } else { AMBIENT_TEMPERATURE };
        self.cooler.locked = enabled;
        Ok(())
    }

    fn cooler_status(&mut self) -> Result<CoolerStatus> {
        self.geometry()?;
        Ok(self.cooler)
    }

    fn set_readout_mode(&mut self, mode: ReadoutMode) -> Result<()> {
        self.geometry()?;
        self.mode = mode;
        Ok(())
    }

    fn begin_exposure(&mut self, _exposure: Duration) -> Result<()> {
        self.geometry()?;
        if self.exposing {
            return Err(CamdError::Driver("exposure already in progress".into()));
        }
        self.exposing = true;
        Ok(())
    }

    fn abort_exposure(&mut self) -> Result<()> {
        self.exposing = false;
        Ok(())
    }

    fn read_frame(&mut self, out: &mut [u8]) -> Result<()> {
        let g = self.geometry()?;
        if !self.exposing {
            return Err(CamdError::Driver("read_frame without an exposure".into()));
        }
        if out.len() != g.frame_bytes() {
            return Err(CamdError::Driver(format!(
                "frame buffer is {} bytes, sensor needs {}",
                out.len(),
                g.frame_bytes()
            )));
        }
        if self.settings.readout_time > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(self.settings.readout_time));
        }
        let n = self.frames_read;
        for (i, px) in out.chunks_exact_mut(2).enumerate() {
            let x = (i % g.width as usize) as u32;
            let y = (i / g.width as usize) as u32;
            px.copy_from_slice(&Self::pattern(x, y, n).to_le_bytes());
        }
        self.frames_read += 1;
        self.exposing = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> SimulatedConfig {
        SimulatedConfig {
            width: 4,
            height: 3,
            readout_time: 0.0,
            ..SimulatedConfig::default()
        }
    }

    #[test]
    fn readout_fills_pattern() {
        let mut cam = SimulatedCamera::new(small());
        let g = cam.open("SN").unwrap();
        let mut buf = vec![0u8; g.frame_bytes()];
        cam.begin_exposure(Duration::ZERO).unwrap();
        cam.read_frame(&mut buf).unwrap();
        let px = |x: usize, y: usize| u16::from_le_bytes([buf[(y * 4 + x) * 2], buf[(y * 4 + x) * 2 + 1]]);
        assert_eq!(px(0, 0), 1000);
        assert_eq!(px(3, 2), SimulatedCamera::pattern(3, 2, 0));
    }

    #[test]
    fn read_without_exposure_fails() {
        let mut cam = SimulatedCamera::new(small());
        let g = cam.open("SN").unwrap();
        let mut buf = vec![0u8; g.frame_bytes()];
        assert!(cam.read_frame(&mut buf).is_err());
    }

    #[test]
    fn fail_open_reports_missing_camera() {
        let mut cam = SimulatedCamera::new(SimulatedConfig {
            fail_open: true,
            ..small()
        });
        assert!(cam.open("SN").is_err());
    }

    #[test]
    fn cooling_tracks_setpoint() {
        let mut cam = SimulatedCamera::new(small());
        cam.open("SN").unwrap();
        cam.set_cooling(true, -15.0).unwrap();
        let s = cam.cooler_status().unwrap();
        assert!(s.enabled && s.locked);
        assert_eq!(s.temperature, -15.0);
        cam.set_cooling(false, -15.0).unwrap();
        assert_eq!(cam.cooler_status().unwrap().temperature, AMBIENT_TEMPERATURE);
    }
}
