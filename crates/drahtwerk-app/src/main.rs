// SPDX-License-Identifier: MIT
//
// Drahtwerk — local hardware bridge daemon
//
// Entry point. Initialises logging, takes the single-instance lock, installs
// signal handlers, and drives the supervisor until it stops.
//
// Exit codes: 0 after a clean stop, 1 when another instance holds the lock
// or a generation fails to come up.

use std::process::ExitCode;

use drahtwerk_bridge::{DefaultWiring, InstanceLock, Supervisor, SupervisorHandle};
use drahtwerk_core::VERSION;

const DEFAULT_CONFIG_PATH: &str = "config.json";

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = VERSION, "Drahtwerk starting");

    let lock = match InstanceLock::acquire() {
        Ok(lock) => lock,
        Err(e) => {
            tracing::error!(error = %e, "refusing to start");
            return ExitCode::FAILURE;
        }
    };
    tracing::debug!(path = %lock.path().display(), "instance lock held");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "runtime init failed");
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(async {
        let mut supervisor = Supervisor::new(DefaultWiring::new(config_path));
        install_signal_handlers(supervisor.handle());
        supervisor.run().await
    });

    match outcome {
        Ok(()) => {
            tracing::info!("Drahtwerk stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "bridge failed");
            ExitCode::FAILURE
        }
    }
}

/// SIGINT/SIGTERM stop the daemon; SIGHUP triggers a config-reloading
/// restart.
#[cfg(unix)]
fn install_signal_handlers(handle: SupervisorHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    let stop_handle = handle.clone();
    tokio::spawn(async move {
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "SIGINT handler unavailable");
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                return;
            }
        };
        tokio::select! {
            _ = interrupt.recv() => tracing::info!("SIGINT received, stopping"),
            _ = terminate.recv() => tracing::info!("SIGTERM received, stopping"),
        }
        stop_handle.stop();
    });

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "SIGHUP handler unavailable");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            tracing::info!("SIGHUP received, restarting");
            handle.restart();
        }
    });
}

#[cfg(not(unix))]
fn install_signal_handlers(handle: SupervisorHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping");
            handle.stop();
        }
    });
}
