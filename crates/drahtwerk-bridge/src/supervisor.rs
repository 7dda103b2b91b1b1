// SPDX-License-Identifier: MIT
//
// Lifecycle supervisor.
//
// One run cycle (a "generation") loads a fresh configuration snapshot,
// builds the transport and the adapter set, optionally provisions TLS and
// the management API, then waits for a stop or restart signal. Teardown
// closes the active connections strictly before the listener stops, then
// discards every adapter; a restart builds the next generation from
// scratch. Nothing survives across generations.
//
// Signals arrive from foreign execution contexts (signal handlers, the
// management API) via atomic flags plus a `Notify` wakeup; a 100 ms poll
// backstops the wakeup. Stop wins over a simultaneous restart.
//
// Any construction or start failure aborts `run()` with the error; the
// binary turns that into exit code 1.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use drahtwerk_core::config::BridgeConfig;
use drahtwerk_core::error::Result;
use drahtwerk_core::types::SupervisorState;

use crate::services::BridgeService;
use crate::transport::Transport;

/// Poll interval backstopping the `Notify` wakeup.
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct RunSignals {
    restart: AtomicBool,
    stop: AtomicBool,
    wake: Notify,
}

/// Cloneable control handle, safe to use from any thread or task.
#[derive(Clone)]
pub struct SupervisorHandle {
    signals: Arc<RunSignals>,
}

impl SupervisorHandle {
    fn new(signals: Arc<RunSignals>) -> Self {
        Self { signals }
    }

    /// A handle not driving any supervisor. The flags still work, which is
    /// all collaborators observe.
    pub fn detached() -> Self {
        Self::new(Arc::new(RunSignals {
            restart: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            wake: Notify::new(),
        }))
    }

    /// Request a graceful stop of the current generation.
    pub fn stop(&self) {
        self.signals.stop.store(true, Ordering::SeqCst);
        self.signals.wake.notify_waiters();
    }

    /// Request a teardown and rebuild under a fresh configuration snapshot.
    pub fn restart(&self) {
        self.signals.restart.store(true, Ordering::SeqCst);
        self.signals.wake.notify_waiters();
    }

    pub fn stop_requested(&self) -> bool {
        self.signals.stop.load(Ordering::SeqCst)
    }

    pub fn restart_requested(&self) -> bool {
        self.signals.restart.load(Ordering::SeqCst)
    }
}

/// Construction seam between the control loop and the concrete pieces it
/// composes. The production implementation is
/// [`DefaultWiring`](crate::wiring::DefaultWiring).
pub trait BridgeWiring: Send + 'static {
    /// Load a fresh configuration snapshot for the next generation.
    fn load_config(&self) -> Result<BridgeConfig>;

    fn build_transport(&self, config: &BridgeConfig) -> Result<Arc<dyn Transport>>;

    /// Build the adapter set for this generation, in start order.
    fn build_services(
        &self,
        config: &BridgeConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Vec<Box<dyn BridgeService>>>;

    /// Produce the TLS acceptor, generating certificate material first if
    /// the configuration asks for self-signed provisioning.
    fn provision_tls(&self, config: &BridgeConfig) -> Result<TlsAcceptor>;

    fn build_api(
        &self,
        config: &BridgeConfig,
        handle: SupervisorHandle,
    ) -> Result<Box<dyn BridgeService>>;
}

pub struct Supervisor<W: BridgeWiring> {
    wiring: W,
    signals: Arc<RunSignals>,
}

impl<W: BridgeWiring> Supervisor<W> {
    pub fn new(wiring: W) -> Self {
        Self {
            wiring,
            signals: Arc::new(RunSignals {
                restart: AtomicBool::new(false),
                stop: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle::new(Arc::clone(&self.signals))
    }

    /// Drive generations until a stop is requested. Any failure while
    /// constructing or starting a generation propagates out.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            self.signals.restart.store(false, Ordering::SeqCst);
            info!(state = ?SupervisorState::Running, "starting bridge generation");

            let config = self.wiring.load_config()?;
            let transport = self.wiring.build_transport(&config)?;

            let mut services = self
                .wiring
                .build_services(&config, Arc::clone(&transport))?;
            for service in &mut services {
                service.start().await?;
                debug!(service = service.name(), "service started");
            }

            if config.server.tls_enabled {
                let acceptor = self.wiring.provision_tls(&config)?;
                transport.set_tls(acceptor);
            }

            let mut api = None;
            if config.api.enabled {
                let mut server = self.wiring.build_api(&config, self.handle())?;
                server.start().await?;
                api = Some(server);
            }

            transport.start().await?;
            info!(
                uri = %config.websocket_uri(),
                services = services.len(),
                "bridge generation up"
            );

            self.wait_for_signal().await;
            let stopping = self.signals.stop.load(Ordering::SeqCst);
            info!(
                state = ?if stopping { SupervisorState::Stopping } else { SupervisorState::Restarting },
                "tearing down bridge generation"
            );

            transport.close_connections().await;
            transport.stop().await?;
            drop(api);
            drop(services);

            if stopping {
                break;
            }
        }

        info!(state = ?SupervisorState::Stopped, "supervisor stopped");
        Ok(())
    }

    async fn wait_for_signal(&self) {
        loop {
            if self.signals.stop.load(Ordering::SeqCst)
                || self.signals.restart.load(Ordering::SeqCst)
            {
                return;
            }
            tokio::select! {
                _ = self.signals.wake.notified() => {}
                _ = tokio::time::sleep(SIGNAL_POLL_INTERVAL) => {}
            }
        }
    }
}
