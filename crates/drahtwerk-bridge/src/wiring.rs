// SPDX-License-Identifier: MIT
//
// Production wiring: composes the file config source, the WebSocket
// transport, the real adapters and the TLS provisioning into one
// [`BridgeWiring`] the supervisor can drive.

use std::sync::Arc;

use tokio_rustls::TlsAcceptor;
use tracing::info;

use drahtwerk_core::config::{BridgeConfig, ConfigSource, FileConfigSource};
use drahtwerk_core::error::Result;
use drahtwerk_document::DocumentStore;
use drahtwerk_security::{generate_self_signed, server_acceptor};

use crate::services::{
    ApiServer, BridgeService, CloudProxyService, LpSpooler, PrinterService, SerialService,
};
use crate::supervisor::{BridgeWiring, SupervisorHandle};
use crate::transport::{Transport, WsTransport};

pub struct DefaultWiring {
    config_source: FileConfigSource,
}

impl DefaultWiring {
    pub fn new(config_path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            config_source: FileConfigSource::new(config_path),
        }
    }
}

impl BridgeWiring for DefaultWiring {
    fn load_config(&self) -> Result<BridgeConfig> {
        self.config_source.load()
    }

    fn build_transport(&self, config: &BridgeConfig) -> Result<Arc<dyn Transport>> {
        Ok(Arc::new(WsTransport::new(
            &config.server.bind,
            config.server.port,
        )))
    }

    fn build_services(
        &self,
        config: &BridgeConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Vec<Box<dyn BridgeService>>> {
        let mut services: Vec<Box<dyn BridgeService>> = Vec::new();

        for descriptor in &config.serials {
            services.push(Box::new(SerialService::new(
                descriptor,
                Arc::clone(&transport),
            )));
        }

        let store = Arc::new(DocumentStore::new(&config.downloader)?);
        services.push(Box::new(PrinterService::new(
            store,
            Arc::new(LpSpooler),
            Arc::clone(&transport),
        )));

        if config.cloud_proxy.enabled {
            services.push(Box::new(CloudProxyService::new(
                &config.cloud_proxy.url,
                Arc::clone(&transport),
            )));
        }

        Ok(services)
    }

    fn provision_tls(&self, config: &BridgeConfig) -> Result<TlsAcceptor> {
        let server = &config.server;
        if server.tls_self_signed {
            info!(address = %server.address, "provisioning self-signed certificate");
            generate_self_signed(&server.address, &server.tls_cert, &server.tls_key)?;
        }
        server_acceptor(
            &server.tls_cert,
            &server.tls_key,
            server.tls_ca_bundle.as_deref(),
        )
    }

    fn build_api(
        &self,
        config: &BridgeConfig,
        handle: SupervisorHandle,
    ) -> Result<Box<dyn BridgeService>> {
        Ok(Box::new(ApiServer::new(config, handle)))
    }
}
