// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Lifetime shutter counter, persisted as JSON next to the daemon.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutterCounters {
    /// Exposures taken since `reference_date`.
    pub exposure_count: u64,
    pub reference_date: NaiveDate,
}

impl Default for ShutterCounters {
    fn default() -> Self {
        Self {
            exposure_count: 0,
            reference_date: Utc::now().date_naive(),
        }
    }
}

impl ShutterCounters {
    /// Load from `path`; a missing file starts a fresh count dated today.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no counter file, starting from zero");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write through a temporary file so a crash never leaves a torn file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = tmp_path(path);
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Count one exposure and return the new shutter count.
    pub fn next_exposure(&mut self) -> u64 {
        self.exposure_count += 1;
        self.exposure_count
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    PathBuf::from(s)
}
