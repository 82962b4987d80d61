// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-isolated camera capture daemon.
//
// A command dispatcher forwards control commands to a supervised driver
// process; the driver fills fixed-size slots of a shared-memory frame pool,
// and a pool of output worker processes turns each slot into a FITS file
// for the downstream pipeline.

pub mod shm_name;

mod platform;

mod shm;
pub use shm::{ShmHandle, ShmOpenMode};

mod mutex;
pub use mutex::{IpcMutex, IpcMutexGuard};

mod condition;
pub use condition::IpcCondition;

mod error;
pub use error::{CamdError, Result};

pub mod frame_pool;
pub use frame_pool::{
    FrameHeader, FramePool, FreeSlot, PoolAccounting, PoolGeometry, SequenceMetadata,
    SlotDescriptor, SlotLease,
};

pub mod protocol;
pub use protocol::{CameraState, Command, CommandStatus, ConfigureParams, ReadoutMode, StatusReport};

pub mod config;
pub use config::Config;

pub mod process;
pub mod driver;
pub mod counters;
pub mod supervisor;

pub mod dispatcher;
pub use dispatcher::{DaemonState, Dispatcher};

pub mod pipeline;
pub mod output;
pub mod control;
