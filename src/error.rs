// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

use std::io;

/// Errors raised inside the daemon's own plumbing.
///
/// Caller-visible outcomes of control operations are [`crate::CommandStatus`]
/// values, not errors; a `CamdError` reaching the control surface is mapped to
/// `CommandStatus::Failed` or to a lifecycle status by the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum CamdError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("malformed message: {0}")]
    Protocol(String),

    #[error("frame pool error: {0}")]
    Pool(String),

    #[error("camera driver error: {0}")]
    Driver(String),

    #[error("pipeline handover failed: {0}")]
    Handover(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, CamdError>;
