// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Driver Supervisor: the body of the isolated driver process.
//
// The process reads `Request` frames from its stdin, executes them against a
// `CameraDriver`, and writes `Response` frames to its stdout. The first frame
// it writes (seq 0) is the outcome of opening the camera. A running sequence
// lives on an acquisition thread that draws slots from the frame pool's
// free-slot queue, fills them and pushes them onto the work queue.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use crate::config::Config;
use crate::counters::ShutterCounters;
use crate::driver::{CameraDriver, SensorGeometry};
use crate::error::Result;
use crate::frame_pool::{FrameHeader, FramePool, SequenceMetadata, FRAME_HEADER_LEN};
use crate::protocol::{
    read_frame, write_frame, CameraState, Command, CommandStatus, ReadoutMode, Reply, Request,
    Response, StatusReport,
};

/// Sequence number of the handshake reply.
pub const HANDSHAKE_SEQ: u64 = 0;

/// How often blocking waits re-check the stop and abort flags.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const SLOT_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct Settings {
    exposure: Duration,
    /// 0-indexed inclusive.
    window: [u32; 4],
    binning: [u32; 2],
    mode: ReadoutMode,
}

#[derive(Debug)]
struct AcqStatus {
    state: CameraState,
    frame_limit: u32,
    frame_count: u32,
    exposure_start: Option<Instant>,
    exposure: Duration,
}

/// State shared between the command loop and the acquisition thread.
struct Acquisition {
    status: Mutex<AcqStatus>,
    stop: AtomicBool,
}

impl Acquisition {
    fn set_state(&self, state: CameraState) {
        self.status.lock().state = state;
    }

    fn state(&self) -> CameraState {
        self.status.lock().state
    }

    fn stopping(&self, pool: &FramePool) -> bool {
        self.stop.load(Ordering::Acquire) || pool.abort_requested()
    }
}

pub struct Supervisor<D: CameraDriver + 'static> {
    config: Config,
    sensor: SensorGeometry,
    driver: Arc<Mutex<D>>,
    pool: Arc<FramePool>,
    counters: Arc<Mutex<ShutterCounters>>,
    acq: Arc<Acquisition>,
    thread: Option<JoinHandle<()>>,
    settings: Settings,
}

impl<D: CameraDriver + 'static> Supervisor<D> {
    /// Open the camera and load persisted counters. The error value is the
    /// status reported in the handshake.
    pub fn start(
        config: Config,
        mut driver: D,
        pool: Arc<FramePool>,
    ) -> std::result::Result<Self, CommandStatus> {
        let sensor = driver.open(&config.camera_serial).map_err(|e| {
            tracing::error!("failed to open camera: {e}");
            CommandStatus::CameraNotFound
        })?;
        if FRAME_HEADER_LEN + sensor.frame_bytes() > pool.slot_size() {
            tracing::error!(
                slot_size = pool.slot_size(),
                frame_bytes = sensor.frame_bytes(),
                "frame does not fit in a pool slot"
            );
            return Err(CommandStatus::Failed);
        }
        driver.set_readout_mode(config.mode).map_err(|e| {
            tracing::error!("failed to set readout mode: {e}");
            CommandStatus::Failed
        })?;
        let counters = ShutterCounters::load(&config.counter_path).map_err(|e| {
            tracing::error!("failed to load counters: {e}");
            CommandStatus::Failed
        })?;

        let settings = Settings {
            exposure: Duration::from_secs(1),
            window: sensor.full_window(),
            binning: config.binning,
            mode: config.mode,
        };
        Ok(Self {
            config,
            sensor,
            driver: Arc::new(Mutex::new(driver)),
            pool,
            counters: Arc::new(Mutex::new(counters)),
            acq: Arc::new(Acquisition {
                status: Mutex::new(AcqStatus {
                    state: CameraState::Idle,
                    frame_limit: 0,
                    frame_count: 0,
                    exposure_start: None,
                    exposure: Duration::ZERO,
                }),
                stop: AtomicBool::new(false),
            }),
            thread: None,
            settings,
        })
    }

    pub fn state(&self) -> CameraState {
        self.acq.state()
    }

    fn busy(&self) -> bool {
        self.state() != CameraState::Idle
    }

    /// Execute one command. `None` means the process should exit.
    pub fn execute(&mut self, cmd: Command) -> Option<Reply> {
        let status = match cmd {
            Command::Status => return Some(Reply::Report(self.report())),
            Command::Shutdown => {
                self.shutdown();
                return None;
            }
            Command::Cooling { enabled, quiet } => self.set_cooling(enabled, quiet),
            Command::Exposure { seconds, quiet } => self.set_exposure(seconds, quiet),
            Command::Window { window, quiet } => self.set_window(window, quiet),
            Command::Binning { binning, quiet } => self.set_binning(binning, quiet),
            Command::Mode { mode, quiet } => self.set_mode(mode, quiet),
            Command::Start { count, quiet } => self.start_sequence(count, quiet),
            Command::Stop { quiet } => self.stop_sequence(quiet),
        };
        Some(Reply::Status(status))
    }

    fn set_cooling(&mut self, enabled: bool, quiet: bool) -> CommandStatus {
        let setpoint = self.config.temperature_setpoint;
        match self.driver.lock().set_cooling(enabled, setpoint) {
            Ok(()) => {
                if !quiet {
                    tracing::info!(enabled, setpoint, "cooling updated");
                }
                CommandStatus::Succeeded
            }
            Err(e) => {
                tracing::error!("failed to set cooling: {e}");
                CommandStatus::Failed
            }
        }
    }

    fn set_exposure(&mut self, seconds: f64, quiet: bool) -> CommandStatus {
        if self.busy() {
            return CommandStatus::CameraNotIdle;
        }
        if !seconds.is_finite() || seconds < 0.0 {
            return CommandStatus::InvalidArgument;
        }
        self.settings.exposure = Duration::from_secs_f64(seconds);
        if !quiet {
            tracing::info!(seconds, "exposure time updated");
        }
        CommandStatus::Succeeded
    }

    fn set_window(&mut self, window: Option<[u32; 4]>, quiet: bool) -> CommandStatus {
        if self.busy() {
            return CommandStatus::CameraNotIdle;
        }
        match sensor_window(self.sensor, window) {
            Ok(w) => {
                self.settings.window = w;
                if !quiet {
                    tracing::info!(?w, "window updated");
                }
                CommandStatus::Succeeded
            }
            Err(status) => status,
        }
    }

    fn set_binning(&mut self, binning: Option<[u32; 2]>, quiet: bool) -> CommandStatus {
        if self.busy() {
            return CommandStatus::CameraNotIdle;
        }
        let b = binning.unwrap_or(self.config.binning);
        if b[0] == 0 || b[1] == 0 || b[0] > self.sensor.width || b[1] > self.sensor.height {
            return CommandStatus::InvalidArgument;
        }
        self.settings.binning = b;
        if !quiet {
            tracing::info!(?b, "binning updated");
        }
        CommandStatus::Succeeded
    }

    fn set_mode(&mut self, mode: Option<ReadoutMode>, quiet: bool) -> CommandStatus {
        if self.busy() {
            return CommandStatus::CameraNotIdle;
        }
        let mode = mode.unwrap_or(self.config.mode);
        if let Err(e) = self.driver.lock().set_readout_mode(mode) {
            tracing::error!("failed to set readout mode: {e}");
            return CommandStatus::Failed;
        }
        self.settings.mode = mode;
        if !quiet {
            tracing::info!(mode = mode.as_str(), "readout mode updated");
        }
        CommandStatus::Succeeded
    }

    fn start_sequence(&mut self, count: u32, quiet: bool) -> CommandStatus {
        if self.busy() {
            return CommandStatus::CameraNotIdle;
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        let s = self.settings;
        if s.window[1] - s.window[0] + 1 < s.binning[0] || s.window[3] - s.window[2] + 1 < s.binning[1]
        {
            return CommandStatus::InvalidArgument;
        }

        self.pool.clear_abort();
        self.acq.stop.store(false, Ordering::Release);
        {
            let mut st = self.acq.status.lock();
            st.state = if count == 1 {
                CameraState::Exposing
            } else {
                CameraState::Sequencing
            };
            st.frame_limit = count;
            st.frame_count = 0;
            st.exposure = s.exposure;
            st.exposure_start = None;
        }

        let ctx = SequenceContext {
            driver: Arc::clone(&self.driver),
            pool: Arc::clone(&self.pool),
            counters: Arc::clone(&self.counters),
            acq: Arc::clone(&self.acq),
            sensor: self.sensor,
            settings: s,
            count,
            counter_path: self.config.counter_path.clone(),
            setpoint: self.config.temperature_setpoint,
        };
        match std::thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || ctx.run())
        {
            Ok(t) => self.thread = Some(t),
            Err(e) => {
                tracing::error!("failed to spawn acquisition thread: {e}");
                self.acq.set_state(CameraState::Idle);
                return CommandStatus::Failed;
            }
        }
        if !quiet {
            tracing::info!(count, exposure = s.exposure.as_secs_f64(), "sequence started");
        }
        CommandStatus::Succeeded
    }

    fn stop_sequence(&mut self, quiet: bool) -> CommandStatus {
        if !self.busy() {
            return CommandStatus::CameraNotAcquiring;
        }
        self.halt_acquisition();
        if !quiet {
            tracing::info!("sequence stopped");
        }
        CommandStatus::Succeeded
    }

    /// Signal the acquisition thread and wait for it to wind down.
    fn halt_acquisition(&mut self) {
        if self.busy() {
            self.acq.set_state(CameraState::Aborting);
        }
        self.acq.stop.store(true, Ordering::Release);
        if let Some(t) = self.thread.take() {
            if t.join().is_err() {
                tracing::error!("acquisition thread panicked");
            }
        }
        self.acq.set_state(CameraState::Idle);
    }

    pub fn report(&self) -> StatusReport {
        let st = self.acq.status.lock();
        let progress = match (st.state, st.exposure_start) {
            (CameraState::Exposing | CameraState::Sequencing, Some(t0)) => {
                if st.exposure.is_zero() {
                    1.0
                } else {
                    (t0.elapsed().as_secs_f64() / st.exposure.as_secs_f64()).min(1.0)
                }
            }
            _ => 0.0,
        };
        let cooler = self.driver.lock().cooler_status().unwrap_or_default();
        StatusReport {
            state: st.state,
            cooler_enabled: cooler.enabled,
            cooler_temperature: cooler.temperature,
            cooler_setpoint: cooler.setpoint,
            temperature_locked: cooler.locked,
            exposure_time: self.settings.exposure.as_secs_f64(),
            exposure_progress: progress,
            window: self.settings.window,
            binning: self.settings.binning,
            mode: self.settings.mode,
            sequence_frame_limit: st.frame_limit,
            sequence_frame_count: st.frame_count,
        }
    }

    /// Stop acquisition, persist counters and release the hardware.
    pub fn shutdown(&mut self) {
        self.halt_acquisition();
        if let Err(e) = self.counters.lock().save(&self.config.counter_path) {
            tracing::error!("failed to save counters: {e}");
        }
        if let Err(e) = self.driver.lock().close() {
            tracing::error!("failed to close camera: {e}");
        }
        tracing::info!("camera closed");
    }
}

/// Convert a 1-indexed inclusive window request into the stored 0-indexed
/// form. `None` selects the full sensor.
pub fn sensor_window(
    sensor: SensorGeometry,
    window: Option<[u32; 4]>,
) -> std::result::Result<[u32; 4], CommandStatus> {
    let Some([x1, x2, y1, y2]) = window else {
        return Ok(sensor.full_window());
    };
    if x1 < 1 || y1 < 1 || x1 > x2 || y1 > y2 || x2 > sensor.width || y2 > sensor.height {
        return Err(CommandStatus::WindowOutsideSensor);
    }
    Ok([x1 - 1, x2 - 1, y1 - 1, y2 - 1])
}

// ---------------------------------------------------------------------------
// Acquisition thread
// ---------------------------------------------------------------------------

struct SequenceContext<D: CameraDriver> {
    driver: Arc<Mutex<D>>,
    pool: Arc<FramePool>,
    counters: Arc<Mutex<ShutterCounters>>,
    acq: Arc<Acquisition>,
    sensor: SensorGeometry,
    settings: Settings,
    count: u32,
    counter_path: std::path::PathBuf,
    setpoint: f64,
}

enum FrameOutcome {
    Captured,
    Interrupted,
}

impl<D: CameraDriver> SequenceContext<D> {
    fn run(self) {
        let running_state = self.acq.state();
        let mut frame: u32 = 0;
        while self.count == 0 || frame < self.count {
            if self.acq.stopping(&self.pool) {
                break;
            }
            self.enter(running_state);
            match self.capture(frame + 1) {
                Ok(FrameOutcome::Captured) => {
                    frame += 1;
                    self.acq.status.lock().frame_count = frame;
                }
                Ok(FrameOutcome::Interrupted) => break,
                Err(e) => {
                    tracing::error!(frame = frame + 1, "capture failed: {e}");
                    break;
                }
            }
        }

        if self.pool.abort_requested() {
            tracing::warn!(frames = frame, "sequence aborted by output worker");
        } else {
            tracing::info!(frames = frame, "sequence finished");
        }
        if let Err(e) = self.counters.lock().save(&self.counter_path) {
            tracing::error!("failed to save counters: {e}");
        }
        let mut st = self.acq.status.lock();
        st.exposure_start = None;
        // `halt_acquisition` owns the Aborting → Idle transition.
        if st.state != CameraState::Aborting {
            st.state = CameraState::Idle;
        }
    }

    fn capture(&self, frame_counter: u32) -> Result<FrameOutcome> {
        let s = self.settings;
        let start_ns = now_ns();
        self.driver.lock().begin_exposure(s.exposure)?;
        let t0 = Instant::now();
        self.acq.status.lock().exposure_start = Some(t0);

        while t0.elapsed() < s.exposure {
            if self.acq.stopping(&self.pool) {
                self.driver.lock().abort_exposure()?;
                return Ok(FrameOutcome::Interrupted);
            }
            std::thread::sleep(POLL_INTERVAL.min(s.exposure.saturating_sub(t0.elapsed())));
        }
        self.enter(CameraState::Reading);

        // Backpressure: block until an output worker frees a slot.
        let mut slot = loop {
            if self.acq.stopping(&self.pool) {
                self.driver.lock().abort_exposure()?;
                return Ok(FrameOutcome::Interrupted);
            }
            if let Some(slot) = self.pool.acquire_free(Some(SLOT_WAIT))? {
                break slot;
            }
        };

        let frame_bytes = self.sensor.frame_bytes();
        let cooler = {
            let mut drv = self.driver.lock();
            let (_, rest) = slot.data_mut().split_at_mut(FRAME_HEADER_LEN);
            drv.read_frame(&mut rest[..frame_bytes])?;
            drv.cooler_status()?
        };

        let mut header = FrameHeader::new();
        header.mode = s.mode.to_raw();
        header.sensor_width = self.sensor.width;
        header.sensor_height = self.sensor.height;
        header.window = s.window;
        header.binning = s.binning;
        header.exposure_ns = s.exposure.as_nanos() as u64;
        header.start_ns = start_ns;
        header.end_ns = now_ns();
        header.cooler_temperature = cooler.temperature;
        header.cooler_setpoint = if cooler.enabled { cooler.setpoint } else { self.setpoint };
        header.cooler_locked = cooler.locked as u32;
        header.cooler_enabled = cooler.enabled as u32;
        header.pixel_bytes = frame_bytes as u64;
        header.write_to(slot.data_mut())?;

        let shutter_counter = self.counters.lock().next_exposure();
        let meta = SequenceMetadata {
            frame_counter: frame_counter as u64,
            shutter_counter,
            timestamp_ns: start_ns,
        };
        if !slot.submit(FRAME_HEADER_LEN + frame_bytes, meta)? {
            tracing::warn!(frame_counter, "pool was rebuilt during capture, frame dropped");
        }
        Ok(FrameOutcome::Captured)
    }

    /// Move to `state` unless a stop is already winding the sequence down.
    fn enter(&self, state: CameraState) {
        let mut st = self.acq.status.lock();
        if st.state != CameraState::Aborting {
            st.state = state;
        }
    }
}

fn now_ns() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Process entry
// ---------------------------------------------------------------------------

/// Run the driver process: open the camera, report the outcome as the
/// handshake reply, then serve commands until `shutdown` or end of input.
pub fn serve<D, R, W>(config: Config, driver: D, reader: &mut R, writer: &mut W) -> Result<()>
where
    D: CameraDriver + 'static,
    R: Read,
    W: Write,
{
    let handshake = |writer: &mut W, status: CommandStatus| {
        write_frame(
            writer,
            &Response {
                seq: HANDSHAKE_SEQ,
                reply: Reply::Status(status),
            },
        )
    };

    let pool = match FramePool::open(&config.pool_name()) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            tracing::error!("failed to attach frame pool: {e}");
            handshake(writer, CommandStatus::Failed)?;
            return Err(e);
        }
    };
    let mut sup = match Supervisor::start(config, driver, pool) {
        Ok(s) => s,
        Err(status) => return handshake(writer, status),
    };
    handshake(writer, CommandStatus::Succeeded)?;
    tracing::info!("driver ready");

    loop {
        let Some(req) = read_frame::<_, Request>(reader)? else {
            tracing::warn!("command channel closed, shutting down");
            sup.shutdown();
            return Ok(());
        };
        let name = req.message.name();
        tracing::debug!(seq = req.seq, command = name, "received command");
        match sup.execute(req.message) {
            Some(reply) => write_frame(writer, &Response { seq: req.seq, reply })?,
            None => return Ok(()),
        }
    }
}
