// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Output worker process.
//
// Usage: camd-output [index]
//
// Reads the daemon configuration as one frame on stdin, attaches to the frame
// pool and drains its work queue until the daemon raises the stop signal.

use std::io;
use std::sync::Arc;

use camd::output::OutputWorker;
use camd::pipeline::{LocalPipeline, Pipeline, UnixSocketPipeline};
use camd::protocol::read_frame;
use camd::{Config, FramePool};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }

    let args: Vec<String> = std::env::args().collect();
    let index: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);

    let config: Config = match read_frame(&mut io::stdin().lock()) {
        Ok(Some(c)) => c,
        Ok(None) => {
            tracing::error!("stdin closed before configuration arrived");
            std::process::exit(2);
        }
        Err(e) => {
            tracing::error!("failed to read configuration: {e}");
            std::process::exit(2);
        }
    };

    let pool = match FramePool::open(&config.pool_name()) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            tracing::error!(worker = index, "failed to attach frame pool: {e}");
            std::process::exit(1);
        }
    };

    let pipeline: Arc<dyn Pipeline> = match &config.pipeline_socket {
        Some(path) => Arc::new(UnixSocketPipeline::new(path, config.handover_timeout())),
        None => Arc::new(LocalPipeline),
    };

    if let Err(e) = OutputWorker::new(config, pool, pipeline, index).run() {
        tracing::error!(worker = index, "output worker failed: {e}");
        std::process::exit(1);
    }
}
