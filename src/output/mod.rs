// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Output workers: drain the work queue, turn each frame into a FITS file and
// hand it to the downstream pipeline.

pub mod fits;
pub mod region;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::error::Result;
use crate::frame_pool::{FrameHeader, FramePool, SlotDescriptor, SlotLease};
use crate::pipeline::{handover_with_timeout, Artifact, Pipeline};
use crate::process::{resolve_executable, ChildProcess};
use crate::protocol::{write_frame, ReadoutMode};

use fits::FitsHeader;
use region::{crop_and_bin, BinnedImage, Region};

/// How long a worker blocks on the work queue before re-checking the stop
/// signal.
pub const WORK_POLL: Duration = Duration::from_millis(250);

pub struct OutputWorker {
    config: Config,
    pool: Arc<FramePool>,
    pipeline: Arc<dyn Pipeline>,
    index: usize,
}

impl OutputWorker {
    pub fn new(config: Config, pool: Arc<FramePool>, pipeline: Arc<dyn Pipeline>, index: usize) -> Self {
        Self {
            config,
            pool,
            pipeline,
            index,
        }
    }

    /// Drain the work queue until the stop signal is raised.
    pub fn run(&self) -> Result<()> {
        fs::create_dir_all(&self.config.output_path)?;
        tracing::info!(worker = self.index, "output worker started");
        loop {
            match self.pool.take_work(Some(WORK_POLL))? {
                Some(lease) => {
                    self.process(lease);
                }
                None if self.pool.stop_requested() => break,
                None => {}
            }
        }
        tracing::info!(worker = self.index, "output worker stopped");
        Ok(())
    }

    /// Save and hand over one frame. A failure at either step aborts the
    /// running sequence. The slot is released on every path.
    ///
    /// A frame from an earlier pool generation is dropped unsaved: its slot
    /// may already belong to a new driver.
    pub fn process(&self, lease: SlotLease<'_>) -> Option<Artifact> {
        let desc = *lease.descriptor();
        if desc.generation != self.pool.generation() {
            tracing::warn!(
                worker = self.index,
                generation = desc.generation,
                "dropping frame from a previous pool generation"
            );
            if let Err(e) = lease.release() {
                tracing::debug!(offset = desc.offset, "stale release failed: {e}");
            }
            return None;
        }
        let delivered = self.save(&lease).and_then(|artifact| {
            handover_with_timeout(
                Arc::clone(&self.pipeline),
                artifact.clone(),
                self.config.handover_timeout(),
            )
            .map(|()| artifact)
        });

        if let Err(e) = lease.release() {
            tracing::error!(offset = desc.offset, "failed to release frame slot: {e}");
        }

        match delivered {
            Ok(artifact) => {
                tracing::debug!(
                    worker = self.index,
                    path = %artifact.path.display(),
                    "frame delivered"
                );
                Some(artifact)
            }
            Err(e) if desc.generation != self.pool.generation() => {
                tracing::warn!(worker = self.index, "frame from a previous pool generation not delivered: {e}");
                None
            }
            Err(e) => {
                tracing::error!(
                    worker = self.index,
                    frame = desc.meta.frame_counter,
                    "frame not delivered, aborting sequence: {e}"
                );
                self.pool.request_abort();
                None
            }
        }
    }

    fn save(&self, lease: &SlotLease<'_>) -> Result<Artifact> {
        let data = lease.data();
        let desc = lease.descriptor();
        let frame = FrameHeader::read_from(data)?;
        let (image, covered) = crop_and_bin(
            frame.pixels(data),
            frame.sensor_width,
            frame.sensor_height,
            Region::from_window(frame.window),
            frame.binning,
        )?;

        let path = artifact_path(&self.config, desc.meta.shutter_counter);
        let tmp = path.with_extension("fits.tmp");
        let header = self.header(&frame, desc, &image, covered);
        if let Err(e) = fits::write_file(&tmp, &header, self.config.header_card_capacity, &image)
            .and_then(|()| fs::rename(&tmp, &path).map_err(Into::into))
        {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }

        Ok(Artifact {
            path,
            camera_id: self.config.camera_id.clone(),
            frame_counter: desc.meta.frame_counter,
            shutter_counter: desc.meta.shutter_counter,
        })
    }

    fn header(&self, frame: &FrameHeader, desc: &SlotDescriptor, image: &BinnedImage, covered: Region) -> FitsHeader {
        let mode = ReadoutMode::from_raw(frame.mode).unwrap_or_default();
        let mut h = FitsHeader::for_image(image.width, image.height);
        h.push("DATE-OBS", iso8601(frame.start_ns), "exposure start (UTC)");
        h.push("DATE-END", iso8601(frame.end_ns), "exposure end (UTC)");
        h.push("EXPTIME", frame.exposure_ns as f64 / 1e9, "exposure time (s)");
        h.push("CAMID", self.config.camera_id.as_str(), "camera identifier");
        h.push("CAM-SRN", self.config.camera_serial.as_str(), "camera serial number");
        h.push("CAM-MODE", mode.as_str(), "readout mode");
        h.push("CAM-XBIN", frame.binning[0], "x binning");
        h.push("CAM-YBIN", frame.binning[1], "y binning");
        h.push("CAM-WIND", covered.header_string(), "readout window");
        h.push("CAM-COOL", frame.cooler_enabled != 0, "cooler enabled");
        h.push("CAM-TEMP", frame.cooler_temperature, "sensor temperature (C)");
        h.push("CAM-TSET", frame.cooler_setpoint, "temperature setpoint (C)");
        h.push("CAM-TLCK", frame.cooler_locked != 0, "temperature locked");
        h.push("FRAMENUM", desc.meta.frame_counter, "frame number in sequence");
        h.push("SHUTRCNT", desc.meta.shutter_counter, "lifetime exposure count");
        if let Some(filter) = &self.config.filter {
            h.push("FILTER", filter.as_str(), "filter name");
        }
        h
    }
}

fn iso8601(ns: i64) -> String {
    let secs = ns.div_euclid(1_000_000_000);
    let nanos = ns.rem_euclid(1_000_000_000) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S%.3f").to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Worker processes
// ---------------------------------------------------------------------------

/// The daemon's set of `camd-output` processes.
pub struct OutputWorkerPool {
    config: Config,
    exe: PathBuf,
    workers: Vec<ChildProcess>,
}

impl OutputWorkerPool {
    /// Spawn `config.workers` processes and hand each its configuration.
    pub fn spawn(config: &Config) -> Result<Self> {
        let exe = resolve_executable(config.output_executable.as_deref(), "camd-output")?;
        let mut pool = Self {
            config: config.clone(),
            exe,
            workers: Vec::with_capacity(config.workers),
        };
        for i in 0..config.workers {
            match pool.spawn_one(i) {
                Ok(p) => pool.workers.push(p),
                Err(e) => {
                    pool.kill_all();
                    return Err(e);
                }
            }
        }
        tracing::info!(workers = config.workers, exe = %pool.exe.display(), "output workers started");
        Ok(pool)
    }

    fn spawn_one(&self, index: usize) -> Result<ChildProcess> {
        let arg = index.to_string();
        let mut p = ChildProcess::spawn(&format!("camd-output-{index}"), &self.exe, &[&arg])?;
        drop(p.take_stdout());
        let sent = match p.take_stdin() {
            Some(mut stdin) => write_frame(&mut stdin, &self.config),
            None => Ok(()),
        };
        if let Err(e) = sent {
            p.force_kill();
            p.wait_for_exit(Duration::from_secs(1));
            return Err(e);
        }
        Ok(p)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn alive(&mut self) -> usize {
        self.workers.iter_mut().map(|p| p.is_alive()).filter(|&a| a).count()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.workers.iter().map(ChildProcess::pid).collect()
    }

    /// Replace every worker process that has exited. Returns how many were
    /// restarted.
    ///
    /// A slot the dead worker was holding stays out of circulation until the
    /// next pool reconciliation (`shutdown` or `initialize`).
    pub fn respawn_dead(&mut self) -> usize {
        let mut restarted = 0;
        for i in 0..self.workers.len() {
            if self.workers[i].is_alive() {
                continue;
            }
            let r = self.workers[i].exit_status().unwrap_or_default();
            tracing::error!(
                name = self.workers[i].name(),
                pid = self.workers[i].pid(),
                code = r.exit_code,
                signal = r.signal,
                "output worker died, restarting"
            );
            match self.spawn_one(i) {
                Ok(p) => {
                    tracing::info!(name = p.name(), pid = p.pid(), "output worker restarted");
                    self.workers[i] = p;
                    restarted += 1;
                }
                Err(e) => tracing::error!(worker = i, "failed to restart output worker: {e}"),
            }
        }
        restarted
    }

    /// Wait up to `grace` in total for the workers to exit after the stop
    /// signal, then kill the stragglers.
    pub fn join(&mut self, grace: Duration) {
        let deadline = Instant::now() + grace;
        for p in &mut self.workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (_, killed) = p.join_or_kill(remaining);
            if !killed {
                tracing::debug!(name = p.name(), "output worker exited");
            }
        }
    }

    fn kill_all(&mut self) {
        for p in &mut self.workers {
            p.force_kill();
            p.wait_for_exit(Duration::from_secs(1));
        }
    }
}

/// Where a worker with the given config writes frame `shutter_counter`.
pub fn artifact_path(config: &Config, shutter_counter: u64) -> PathBuf {
    config
        .output_path
        .join(format!("{}-{:08}.fits", config.camera_id, shutter_counter))
}
