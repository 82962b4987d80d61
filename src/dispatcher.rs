// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Command Dispatcher: the control surface of the daemon.
//
// Two locks, never nested the other way round:
//   command_right  try-only; held for the whole of a mutating operation,
//                  contention is reported to the caller as `Blocked`
//   handle         blocking; guards the driver process handle so that
//                  initialize/shutdown cannot race a forward in flight
//
// `state` is a leaf lock taken briefly under either of them. It records the
// lifecycle (Uninitialized, Initializing, Ready) and is only written while
// holding `command_right`. Busy is never stored: `daemon_state` derives it
// from the driver's own report.

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, ChildStdout};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::Config;
use crate::error::{CamdError, Result};
use crate::frame_pool::FramePool;
use crate::process::{resolve_executable, wait_readable, ChildProcess};
use crate::protocol::{
    read_frame, write_frame, CameraState, Command, CommandStatus, ConfigureParams, ReadoutMode,
    Reply, Request, Response, StatusReport,
};
use crate::supervisor::HANDSHAKE_SEQ;

/// How long `shutdown` waits for the driver process before killing it.
pub const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_millis(4500);

/// `configure` defaults for absent keys.
const DEFAULT_COOLING: bool = true;
const DEFAULT_EXPOSURE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DaemonState {
    Uninitialized,
    Initializing,
    Ready,
    Busy,
}

// ---------------------------------------------------------------------------
// SupervisorHandle: the dispatcher's end of the driver process
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("driver process closed its channel")]
    Closed,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Fault(CamdError),
}

impl From<CamdError> for ChannelError {
    fn from(e: CamdError) -> Self {
        match e {
            CamdError::Io(ref err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::ConnectionReset
                ) =>
            {
                ChannelError::Closed
            }
            other => ChannelError::Fault(other),
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        CamdError::Io(e).into()
    }
}

/// A live driver process plus its duplex channel.
pub struct SupervisorHandle {
    process: ChildProcess,
    writer: ChildStdin,
    reader: ChildStdout,
    next_seq: u64,
}

impl SupervisorHandle {
    /// Start the driver process and hand it its configuration.
    pub fn spawn(executable: &Path, config: &Config) -> Result<Self> {
        let mut process = ChildProcess::spawn("camd-driver", executable, &[])?;
        let (Some(mut writer), Some(reader)) = (process.take_stdin(), process.take_stdout()) else {
            process.force_kill();
            return Err(CamdError::Driver("driver process has no stdio pipes".into()));
        };
        if let Err(e) = write_frame(&mut writer, config) {
            process.force_kill();
            process.wait_for_exit(Duration::from_secs(1));
            return Err(e);
        }
        Ok(Self {
            process,
            writer,
            reader,
            next_seq: HANDSHAKE_SEQ + 1,
        })
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn is_alive(&mut self) -> bool {
        self.process.is_alive()
    }

    /// Wait for the driver to report whether the camera opened.
    pub fn await_handshake(&mut self, timeout: Duration) -> std::result::Result<CommandStatus, ChannelError> {
        Ok(self.recv(HANDSHAKE_SEQ, timeout)?.status())
    }

    /// Send `message` and wait up to `timeout` for its reply.
    pub fn request(&mut self, message: Command, timeout: Duration) -> std::result::Result<Reply, ChannelError> {
        let seq = self.send(message)?;
        self.recv(seq, timeout)
    }

    /// Send `message` without waiting for a reply.
    pub fn notify(&mut self, message: Command) -> std::result::Result<(), ChannelError> {
        self.send(message).map(|_| ())
    }

    fn send(&mut self, message: Command) -> std::result::Result<u64, ChannelError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        write_frame(&mut self.writer, &Request { seq, message })?;
        Ok(seq)
    }

    fn recv(&mut self, seq: u64, timeout: Duration) -> std::result::Result<Reply, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !wait_readable(&self.reader, remaining)? {
                return Err(ChannelError::Timeout(timeout));
            }
            match read_frame::<_, Response>(&mut self.reader)? {
                None => return Err(ChannelError::Closed),
                Some(resp) if resp.seq == seq => return Ok(resp.reply),
                // Late reply to a request that already timed out.
                Some(resp) => tracing::debug!(seq = resp.seq, want = seq, "discarding stale reply"),
            }
        }
    }

    /// Kill the process and reap it.
    pub fn terminate(mut self) {
        self.process.force_kill();
        self.process.wait_for_exit(Duration::from_secs(1));
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    config: Config,
    pool: Arc<FramePool>,
    driver_executable: PathBuf,
    shutdown_timeout: Duration,
    command_right: Mutex<()>,
    handle: Mutex<Option<SupervisorHandle>>,
    state: Mutex<DaemonState>,
}

impl Dispatcher {
    pub fn new(config: Config, pool: Arc<FramePool>) -> Result<Self> {
        let driver_executable = resolve_executable(config.driver_executable.as_deref(), "camd-driver")?;
        Ok(Self {
            config,
            pool,
            driver_executable,
            shutdown_timeout: SHUTDOWN_JOIN_TIMEOUT,
            command_right: Mutex::new(()),
            handle: Mutex::new(None),
            state: Mutex::new(DaemonState::Uninitialized),
        })
    }

    /// Override the join bound used by `shutdown`.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    /// Lifecycle state, with Ready refined to Busy while the driver reports
    /// an acquisition and to Uninitialized once the driver is gone.
    pub fn daemon_state(&self) -> DaemonState {
        let stored = *self.state.lock();
        if stored != DaemonState::Ready {
            return stored;
        }
        match self.forward_reply(Command::Status) {
            Ok(Reply::Report(r)) if r.state.is_acquiring() => DaemonState::Busy,
            Ok(Reply::Report(_)) => DaemonState::Ready,
            _ => DaemonState::Uninitialized,
        }
    }

    /// Pid of the live driver process, if any.
    pub fn supervisor_pid(&self) -> Option<u32> {
        self.handle.lock().as_ref().map(SupervisorHandle::pid)
    }

    // --- lifecycle ---

    /// Start a new driver process.
    pub fn initialize(&self, caller: IpAddr) -> CommandStatus {
        self.serialized(caller, "initialize", || {
            let mut handle = self.handle.lock();
            if let Some(h) = handle.as_mut() {
                if h.is_alive() {
                    return CommandStatus::CameraNotUninitialized;
                }
                self.lost_supervisor(&mut handle, "process exited");
            }

            self.set_state(DaemonState::Initializing);
            let status = self.launch(&mut handle);
            self.set_state(if status.is_success() {
                DaemonState::Ready
            } else {
                DaemonState::Uninitialized
            });
            status
        })
    }

    fn launch(&self, slot: &mut Option<SupervisorHandle>) -> CommandStatus {
        match self.pool.rebuild() {
            Ok(r) => tracing::debug!(free = r.free, work = r.work, "frame pool rebuilt"),
            Err(e) => {
                tracing::error!("failed to rebuild frame pool: {e}");
                return CommandStatus::Failed;
            }
        }

        let mut h = match SupervisorHandle::spawn(&self.driver_executable, &self.config) {
            Ok(h) => h,
            Err(e) => {
                tracing::error!(exe = %self.driver_executable.display(), "failed to start driver process: {e}");
                return CommandStatus::Failed;
            }
        };
        match h.await_handshake(self.config.initialize_timeout()) {
            Ok(CommandStatus::Succeeded) => {
                tracing::info!(pid = h.pid(), "driver process ready");
                *slot = Some(h);
                CommandStatus::Succeeded
            }
            Ok(status) => {
                tracing::warn!(?status, "driver process failed to open the camera");
                h.terminate();
                status
            }
            Err(e) => {
                tracing::error!("driver process handshake failed: {e}");
                h.terminate();
                CommandStatus::Failed
            }
        }
    }

    /// Stop the current driver process.
    pub fn shutdown(&self, caller: IpAddr) -> CommandStatus {
        self.serialized(caller, "shutdown", || {
            let mut handle = self.handle.lock();
            let Some(mut h) = handle.take() else {
                return CommandStatus::CameraNotInitialized;
            };
            if !h.is_alive() {
                *handle = Some(h);
                self.lost_supervisor(&mut handle, "process exited");
                self.set_state(DaemonState::Uninitialized);
                return CommandStatus::CameraNotInitialized;
            }
            self.stop_supervisor(h);
            self.set_state(DaemonState::Uninitialized);
            CommandStatus::Succeeded
        })
    }

    /// Graceful stop with forced fallback, then queue reconciliation.
    fn stop_supervisor(&self, mut h: SupervisorHandle) {
        if let Err(e) = h.notify(Command::Shutdown) {
            tracing::debug!("shutdown request not delivered: {e}");
        }
        let pid = h.pid();
        let (result, killed) = h.process.join_or_kill(self.shutdown_timeout);
        if killed {
            tracing::warn!(pid, "driver process ignored shutdown and was killed");
        } else {
            tracing::info!(pid, code = result.exit_code, "driver process exited");
        }
        self.reconcile_pool();
    }

    /// Forget a driver process that died on its own. The stored lifecycle
    /// state is left to the next serialized command.
    fn lost_supervisor(&self, slot: &mut Option<SupervisorHandle>, reason: &str) {
        if let Some(mut h) = slot.take() {
            let pid = h.pid();
            h.process.force_kill();
            let r = h.process.wait_for_exit(Duration::from_secs(1));
            tracing::warn!(pid, reason, signal = r.signal, code = r.exit_code, "driver process lost");
        }
        self.reconcile_pool();
    }

    fn reconcile_pool(&self) {
        match self.pool.drain() {
            Ok(r) => tracing::info!(free = r.free, work = r.work, "frame pool drained"),
            Err(e) => tracing::error!("failed to drain frame pool: {e}"),
        }
    }

    /// Daemon teardown: stop the driver and tell output workers to exit.
    pub fn close(&self) {
        let _right = self.command_right.lock();
        let mut handle = self.handle.lock();
        if let Some(mut h) = handle.take() {
            if h.is_alive() {
                self.stop_supervisor(h);
            }
        }
        self.set_state(DaemonState::Uninitialized);
        if let Err(e) = self.pool.raise_stop() {
            tracing::error!("failed to raise stop signal: {e}");
        }
    }

    // --- forwarded commands ---

    pub fn set_cooling(&self, caller: IpAddr, enabled: bool) -> CommandStatus {
        self.serialized(caller, "set_cooling", || {
            self.forward(Command::Cooling { enabled, quiet: false })
        })
    }

    pub fn set_exposure(&self, caller: IpAddr, seconds: f64) -> CommandStatus {
        self.serialized(caller, "set_exposure", || {
            self.forward(Command::Exposure { seconds, quiet: false })
        })
    }

    pub fn set_window(&self, caller: IpAddr, window: Option<[u32; 4]>) -> CommandStatus {
        self.serialized(caller, "set_window", || {
            self.forward(Command::Window { window, quiet: false })
        })
    }

    pub fn set_binning(&self, caller: IpAddr, binning: Option<[u32; 2]>) -> CommandStatus {
        self.serialized(caller, "set_binning", || {
            self.forward(Command::Binning { binning, quiet: false })
        })
    }

    pub fn set_mode(&self, caller: IpAddr, mode: Option<ReadoutMode>) -> CommandStatus {
        self.serialized(caller, "set_mode", || {
            self.forward(Command::Mode { mode, quiet: false })
        })
    }

    /// Apply cooling, exposure, window, binning and mode in that order.
    /// Every step runs; the first failure is returned.
    pub fn configure(&self, caller: IpAddr, params: &ConfigureParams) -> CommandStatus {
        self.serialized(caller, "configure", || {
            let steps = [
                Command::Cooling {
                    enabled: params.cooling.unwrap_or(DEFAULT_COOLING),
                    quiet: true,
                },
                Command::Exposure {
                    seconds: params.exposure.unwrap_or(DEFAULT_EXPOSURE),
                    quiet: true,
                },
                Command::Window {
                    window: params.window,
                    quiet: true,
                },
                Command::Binning {
                    binning: params.bin,
                    quiet: true,
                },
                Command::Mode {
                    mode: params.mode,
                    quiet: true,
                },
            ];

            let mut first_failure = None;
            for step in steps {
                let name = step.name();
                let status = self.forward(step);
                if !status.is_success() {
                    tracing::warn!(command = name, ?status, "configure step failed");
                    first_failure.get_or_insert(status);
                }
            }
            let status = first_failure.unwrap_or(CommandStatus::Succeeded);
            tracing::info!(?params, ?status, "configured camera");
            status
        })
    }

    pub fn start_sequence(&self, caller: IpAddr, count: u32) -> CommandStatus {
        self.serialized(caller, "start_sequence", || {
            self.forward(Command::Start { count, quiet: false })
        })
    }

    /// Not serialized, so it can interrupt a sequence at any time.
    pub fn stop_sequence(&self, caller: IpAddr) -> CommandStatus {
        if let Err(status) = self.authorize(caller, "stop_sequence") {
            return status;
        }
        self.forward(Command::Stop { quiet: false })
    }

    /// Read-only; bypasses the serialization right.
    pub fn report_status(&self, caller: IpAddr) -> std::result::Result<StatusReport, CommandStatus> {
        self.authorize(caller, "report_status")?;
        if *self.state.lock() == DaemonState::Initializing {
            return Ok(StatusReport::with_state(CameraState::Initializing));
        }
        Ok(match self.forward_reply(Command::Status) {
            Ok(Reply::Report(r)) => r,
            _ => StatusReport::disabled(),
        })
    }

    // --- helpers ---

    fn authorize(&self, caller: IpAddr, op: &str) -> std::result::Result<(), CommandStatus> {
        if self.config.is_control_ip(caller) {
            Ok(())
        } else {
            tracing::warn!(%caller, op, "rejected command from unauthorized address");
            Err(CommandStatus::InvalidControlIp)
        }
    }

    /// Run `op` holding the command-serialization right, or report `Blocked`.
    fn serialized(&self, caller: IpAddr, name: &str, op: impl FnOnce() -> CommandStatus) -> CommandStatus {
        if let Err(status) = self.authorize(caller, name) {
            return status;
        }
        let Some(_right) = self.command_right.try_lock() else {
            tracing::debug!(op = name, "command blocked by one in flight");
            return CommandStatus::Blocked;
        };
        op()
    }

    fn forward(&self, message: Command) -> CommandStatus {
        match self.forward_reply(message) {
            Ok(reply) => reply.status(),
            Err(status) => status,
        }
    }

    fn forward_reply(&self, message: Command) -> std::result::Result<Reply, CommandStatus> {
        let mut handle = self.handle.lock();
        let Some(h) = handle.as_mut() else {
            return Err(CommandStatus::CameraNotInitialized);
        };
        if !h.is_alive() {
            self.lost_supervisor(&mut handle, "process exited");
            return Err(CommandStatus::CameraNotInitialized);
        }
        let name = message.name();
        match h.request(message, self.config.command_timeout()) {
            Ok(reply) => Ok(reply),
            Err(ChannelError::Closed) => {
                self.lost_supervisor(&mut handle, "channel closed");
                Err(CommandStatus::CameraNotInitialized)
            }
            Err(e) => {
                tracing::error!(command = name, "forward failed: {e}");
                Err(CommandStatus::Failed)
            }
        }
    }

    fn set_state(&self, state: DaemonState) {
        *self.state.lock() = state;
    }
}
