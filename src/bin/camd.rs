// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Camera daemon.
//
// Usage: camd <config.toml>
//
// Creates the frame pool, starts the output worker processes and serves the
// control surface until SIGINT/SIGTERM. Output workers that die are restarted.
// The driver process is started and stopped through the `initialize`/`shutdown`
// commands.

use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camd::output::OutputWorkerPool;
use camd::{control, Config, Dispatcher, FramePool};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const WORKER_CHECK_INTERVAL: Duration = Duration::from_secs(1);

static QUIT: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    QUIT.store(true, Ordering::Release);
}

fn run(config_path: &Path) -> camd::Result<()> {
    let config = Config::load(config_path)?;
    tracing::info!(camera = %config.camera_id, serial = %config.camera_serial, "starting camd");

    let pool = Arc::new(FramePool::create(&config.pool_name(), config.pool_geometry()?)?);
    let workers = Arc::new(Mutex::new(OutputWorkerPool::spawn(&config)?));
    let dispatcher = Arc::new(Dispatcher::new(config.clone(), Arc::clone(&pool))?);
    let watchdog = spawn_watchdog(Arc::clone(&workers))?;

    let served = TcpListener::bind(config.listen)
        .map_err(Into::into)
        .and_then(|listener| control::serve(listener, Arc::clone(&dispatcher), &QUIT));
    if let Err(e) = &served {
        tracing::error!("control surface failed: {e}");
    }

    tracing::info!("shutting down");
    QUIT.store(true, Ordering::Release);
    if watchdog.join().is_err() {
        tracing::error!("worker watchdog panicked");
    }
    dispatcher.close();
    workers.lock().join(WORKER_JOIN_TIMEOUT);
    pool.unlink();
    served
}

/// Restart output workers that die while the daemon is serving.
fn spawn_watchdog(workers: Arc<Mutex<OutputWorkerPool>>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new().name("worker-watchdog".into()).spawn(move || {
        let mut last = Instant::now();
        while !QUIT.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(100));
            if last.elapsed() >= WORKER_CHECK_INTERVAL {
                workers.lock().respawn_dead();
                last = Instant::now();
            }
        }
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        eprintln!("usage: camd <config.toml>");
        std::process::exit(1);
    }

    unsafe {
        libc::signal(libc::SIGINT, on_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as *const () as libc::sighandler_t);
    }

    if let Err(e) = run(Path::new(&args[1])) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
