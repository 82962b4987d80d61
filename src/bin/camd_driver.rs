// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Driver Supervisor process, started by the daemon's `initialize`.
//
// stdin/stdout carry the length-prefixed JSON command channel; the first
// frame on stdin is the daemon configuration. Logs go to stderr.

use std::io;

use camd::driver::SimulatedCamera;
use camd::protocol::read_frame;
use camd::{supervisor, Config};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    // Ctrl-C at the daemon's terminal is the daemon's to handle.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }

    let mut reader = io::stdin().lock();
    let mut writer = io::stdout().lock();

    let config: Config = match read_frame(&mut reader) {
        Ok(Some(c)) => c,
        Ok(None) => {
            tracing::error!("channel closed before configuration arrived");
            std::process::exit(2);
        }
        Err(e) => {
            tracing::error!("failed to read configuration: {e}");
            std::process::exit(2);
        }
    };

    let driver = SimulatedCamera::new(config.simulated.clone());
    if let Err(e) = supervisor::serve(config, driver, &mut reader, &mut writer) {
        tracing::error!("driver process failed: {e}");
        std::process::exit(1);
    }
}
