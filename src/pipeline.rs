// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Downstream pipeline interface and bounded-time handover.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};

use crate::error::{CamdError, Result};

/// A finished output artifact offered to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: PathBuf,
    pub camera_id: String,
    pub frame_counter: u64,
    pub shutter_counter: u64,
}

/// Downstream consumer of output artifacts.
pub trait Pipeline: Send + Sync {
    /// Offer `artifact`. `Ok(())` means accepted; an error means rejected.
    fn handover(&self, artifact: &Artifact) -> Result<()>;
}

/// Accepts every artifact and leaves it on disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalPipeline;

impl Pipeline for LocalPipeline {
    fn handover(&self, artifact: &Artifact) -> Result<()> {
        tracing::debug!(path = %artifact.path.display(), "artifact kept locally");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct PipelineReply {
    accepted: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// Hands artifacts to a pipeline daemon listening on a unix socket.
///
/// One JSON line per artifact; the daemon answers with one JSON line
/// `{"accepted": bool, "reason": "..."}`. Reads and writes on the
/// connection give up after `timeout`, so a daemon that never answers
/// cannot pin the calling thread.
#[derive(Debug, Clone)]
pub struct UnixSocketPipeline {
    path: PathBuf,
    timeout: Duration,
}

impl UnixSocketPipeline {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn exchange(&self, stream: &UnixStream, artifact: &Artifact) -> io::Result<String> {
        let io_timeout = Some(self.timeout.max(Duration::from_millis(1)));
        stream.set_write_timeout(io_timeout)?;
        stream.set_read_timeout(io_timeout)?;

        let mut line = serde_json::to_vec(artifact)?;
        line.push(b'\n');
        let mut writer = stream;
        writer.write_all(&line)?;
        writer.flush()?;

        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply)?;
        Ok(reply)
    }
}

impl Pipeline for UnixSocketPipeline {
    fn handover(&self, artifact: &Artifact) -> Result<()> {
        let stream = UnixStream::connect(&self.path).map_err(|e| {
            CamdError::Handover(format!("connecting to {}: {e}", self.path.display()))
        })?;
        let reply = match self.exchange(&stream, artifact) {
            Ok(r) => r,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(CamdError::Handover(format!(
                    "no reply from {} within {:.1}s",
                    self.path.display(),
                    self.timeout.as_secs_f64()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        if reply.is_empty() {
            return Err(CamdError::Handover("pipeline closed without replying".into()));
        }
        let reply: PipelineReply = serde_json::from_str(reply.trim_end())?;
        if reply.accepted {
            Ok(())
        } else {
            Err(CamdError::Handover(format!(
                "rejected: {}",
                reply.reason.as_deref().unwrap_or("no reason given")
            )))
        }
    }
}

/// Run `pipeline.handover` on a helper thread and wait at most `timeout`.
///
/// A handover that overruns keeps running on its thread until the pipeline
/// itself gives up; its late result is dropped.
pub fn handover_with_timeout(
    pipeline: Arc<dyn Pipeline>,
    artifact: Artifact,
    timeout: Duration,
) -> Result<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::Builder::new()
        .name("handover".into())
        .spawn(move || {
            let _ = tx.send(pipeline.handover(&artifact));
        })?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(CamdError::Handover(format!(
            "not accepted within {:.1}s",
            timeout.as_secs_f64()
        ))),
        Err(RecvTimeoutError::Disconnected) => {
            Err(CamdError::Handover("handover thread exited without a result".into()))
        }
    }
}
