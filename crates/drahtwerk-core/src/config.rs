// SPDX-License-Identifier: MIT
//
// Bridge configuration — an immutable snapshot loaded once per run cycle.
//
// The on-disk surface is camelCase JSON so existing web-bridge configurator
// files keep working unchanged:
//
// ```json
// {
//   "server": { "bind": "0.0.0.0", "port": 12212, "tlsEnabled": false, ... },
//   "serials": [ { "name": "/dev/ttyUSB0", "key": "scale" } ],
//   "cloudProxy": { "enabled": false },
//   "api": { "enabled": true },
//   "downloader": { "path": "documents/", "timeout": 30 }
// }
// ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DrahtwerkError, Result};

/// Full configuration snapshot for one run cycle of the supervisor.
///
/// A snapshot is loaded before any service starts and is never mutated while
/// that cycle runs; applying changes means restarting the supervisor, which
/// loads a fresh snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    /// One serial adapter is created per descriptor, in order.
    pub serials: Vec<SerialConfig>,
    pub cloud_proxy: CloudProxyConfig,
    pub api: ApiConfig,
    pub downloader: DownloaderConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            serials: Vec::new(),
            cloud_proxy: CloudProxyConfig::default(),
            api: ApiConfig::default(),
            downloader: DownloaderConfig::default(),
        }
    }
}

/// Gateway listener settings, including the TLS options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    /// Local address the transport binds to.
    pub bind: String,
    pub port: u16,
    /// Public address clients use to reach the bridge; also the subject of
    /// a generated self-signed certificate.
    pub address: String,
    pub tls_enabled: bool,
    pub tls_self_signed: bool,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub tls_ca_bundle: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 12212,
            address: "127.0.0.1".into(),
            tls_enabled: false,
            tls_self_signed: false,
            tls_cert: PathBuf::from("tls/server.crt"),
            tls_key: PathBuf::from("tls/server.key"),
            tls_ca_bundle: None,
        }
    }
}

/// One physical serial channel: the device it maps to and the access key
/// clients use to address it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialConfig {
    /// Device name, e.g. `/dev/ttyUSB0` or `COM3`.
    pub name: String,
    /// Channel key clients connect to (`/serial/{key}`).
    pub key: String,
}

/// Cloud proxy tunnel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudProxyConfig {
    pub enabled: bool,
    /// WebSocket endpoint of the cloud proxy.
    pub url: String,
}

impl Default for CloudProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "wss://proxy.example.com/bridge".into(),
        }
    }
}

/// Local HTTP API settings. The API listener is independent of the
/// WebSocket transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".into(),
            port: 12213,
        }
    }
}

/// Document download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloaderConfig {
    /// Directory resolved documents are written into.
    pub path: PathBuf,
    /// Skip TLS certificate verification when fetching documents.
    #[serde(rename = "ignoreTLSCertificateError")]
    pub ignore_tls_certificate_error: bool,
    /// Fetch timeout in seconds.
    pub timeout: u64,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("documents"),
            ignore_tls_certificate_error: false,
            timeout: 30,
        }
    }
}

impl BridgeConfig {
    /// The URI clients connect to, reflecting the TLS setting.
    pub fn websocket_uri(&self) -> String {
        let scheme = if self.server.tls_enabled { "wss" } else { "ws" };
        format!("{}://{}:{}", scheme, self.server.address, self.server.port)
    }
}

/// Source of configuration snapshots.
///
/// The supervisor calls [`load`](ConfigSource::load) at the top of every run
/// cycle; implementations must return a complete fresh snapshot each time so
/// that no field is carried over from the previous cycle.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<BridgeConfig>;
}

/// File-backed configuration source.
///
/// Reads the JSON file on every load. A missing file is replaced with the
/// defaults, which are also persisted so the user has something to edit.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<BridgeConfig> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "no config file, writing defaults");
            let config = BridgeConfig::default();
            let json = serde_json::to_string_pretty(&config)?;
            std::fs::write(&self.path, json)?;
            return Ok(config);
        }

        let data = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&data)
            .map_err(|e| DrahtwerkError::Config(format!("{}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tls_is_disabled() {
        let config = BridgeConfig::default();
        assert!(!config.server.tls_enabled);
        assert!(!config.server.tls_self_signed);
    }

    #[test]
    fn camel_case_surface_is_recognized() {
        let json = r#"{
            "server": {
                "bind": "0.0.0.0",
                "port": 9000,
                "address": "bridge.local",
                "tlsEnabled": true,
                "tlsSelfSigned": true,
                "tlsCert": "certs/c.pem",
                "tlsKey": "certs/k.pem",
                "tlsCaBundle": "certs/ca.pem"
            },
            "serials": [
                { "name": "/dev/ttyUSB0", "key": "scale" },
                { "name": "/dev/ttyUSB1", "key": "scanner" }
            ],
            "cloudProxy": { "enabled": true, "url": "wss://example.com/t" },
            "api": { "enabled": true },
            "downloader": {
                "path": "dl",
                "ignoreTLSCertificateError": true,
                "timeout": 5
            }
        }"#;

        let config: BridgeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.server.port, 9000);
        assert!(config.server.tls_enabled);
        assert!(config.server.tls_self_signed);
        assert_eq!(config.server.tls_ca_bundle, Some(PathBuf::from("certs/ca.pem")));
        assert_eq!(config.serials.len(), 2);
        assert_eq!(config.serials[1].key, "scanner");
        assert!(config.cloud_proxy.enabled);
        assert!(config.api.enabled);
        assert!(config.downloader.ignore_tls_certificate_error);
        assert_eq!(config.downloader.timeout, 5);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config: BridgeConfig = serde_json::from_str(r#"{ "server": { "port": 80 } }"#).unwrap();
        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(config.serials.is_empty());
        assert!(!config.cloud_proxy.enabled);
    }

    #[test]
    fn websocket_uri_reflects_tls() {
        let mut config = BridgeConfig::default();
        config.server.address = "bridge.local".into();
        config.server.port = 12212;
        assert_eq!(config.websocket_uri(), "ws://bridge.local:12212");

        config.server.tls_enabled = true;
        assert_eq!(config.websocket_uri(), "wss://bridge.local:12212");
    }

    #[test]
    fn file_source_creates_defaults_and_reloads_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let source = FileConfigSource::new(&path);

        let first = source.load().unwrap();
        assert!(path.exists());
        assert_eq!(first.server.port, 12212);

        // Edit the file; the next load must observe the new snapshot.
        let mut edited = first.clone();
        edited.server.port = 4444;
        std::fs::write(&path, serde_json::to_string(&edited).unwrap()).unwrap();

        let second = source.load().unwrap();
        assert_eq!(second.server.port, 4444);
    }

    #[test]
    fn file_source_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = FileConfigSource::new(&path).load().unwrap_err();
        assert!(matches!(err, DrahtwerkError::Config(_)));
    }
}
