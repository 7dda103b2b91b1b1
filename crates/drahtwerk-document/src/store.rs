// SPDX-License-Identifier: MIT
//
// Document store -- turns a print-document reference into a local file.
//
// A reference carries one of three content sources: raw content (nothing to
// resolve), an inline base64 payload, or a bare URL. Inline payloads are
// decoded and URLs are fetched, both landing at a path derived from the URL
// inside the download directory.
//
// The derived path is a function of the URL only, so a later resolution for
// the same URL overwrites the earlier file. Resolution never short-circuits
// on an existing file and never retries; concurrent resolutions for one URL
// race and the last writer wins. Callers own cleanup timing via
// [`DocumentStore::delete_file_for`].

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, info};

use drahtwerk_core::config::DownloaderConfig;
use drahtwerk_core::error::{DrahtwerkError, Result};
use drahtwerk_core::types::PrintDocument;

/// Resolver for print-document references.
///
/// Owns the download directory as a shared, unlocked filesystem resource.
/// One store is built per supervisor run cycle from that cycle's
/// configuration snapshot.
pub struct DocumentStore {
    dir: PathBuf,
    client: reqwest::Client,
}

impl DocumentStore {
    /// Build a store from the downloader configuration, creating the
    /// download directory if absent.
    pub fn new(config: &DownloaderConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.path)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .danger_accept_invalid_certs(config.ignore_tls_certificate_error)
            .build()
            .map_err(|e| DrahtwerkError::Fetch(format!("client setup: {e}")))?;

        Ok(Self {
            dir: config.path.clone(),
            client,
        })
    }

    /// Cache path for a URL: download directory + final path segment, with
    /// literal spaces percent-escaped.
    ///
    /// No other escaping or traversal protection is applied; URLs reach this
    /// point from authenticated bridge clients and are treated as trusted.
    pub fn path_for(&self, url: &str) -> PathBuf {
        let escaped = url.replace(' ', "%20");
        let filename = match escaped.rfind('/') {
            Some(idx) => &escaped[idx + 1..],
            None => escaped.as_str(),
        };
        self.dir.join(filename)
    }

    /// Handle to the cached file for a URL. Purely path arithmetic; the file
    /// may or may not exist.
    pub fn file_for(&self, url: &str) -> PathBuf {
        self.path_for(url)
    }

    /// Remove the cached file for a URL, typically after its print job
    /// completed. Removing an already-absent file is not an error.
    pub fn delete_file_for(&self, url: &str) -> Result<()> {
        match std::fs::remove_file(self.path_for(url)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a document reference into a local file.
    ///
    /// Raw content needs no resolution and returns immediately without
    /// touching the filesystem or network. Otherwise a URL is required; an
    /// inline payload is decoded to the derived path, a bare URL is fetched
    /// to it. Either way an existing file at that path is fully overwritten.
    ///
    /// Fetch errors propagate unchanged; nothing here retries.
    pub async fn resolve(&self, document: &PrintDocument) -> Result<()> {
        if document.has_raw_content() {
            return Ok(());
        }

        if !document.has_url() {
            return Err(DrahtwerkError::UnresolvableDocument);
        }
        let url = document.url.as_deref().unwrap_or_default();

        if document.has_file_content() {
            let payload = document.file_content.as_deref().unwrap_or_default();
            self.extract(payload, url).await
        } else {
            self.download(url).await
        }
    }

    /// Decode an inline base64 payload to the cache path for `url`.
    async fn extract(&self, payload: &str, url: &str) -> Result<()> {
        let bytes = BASE64.decode(payload)?;
        let path = self.path_for(url);
        tokio::fs::write(&path, &bytes).await?;
        debug!(url, path = %path.display(), bytes = bytes.len(), "inline payload extracted");
        Ok(())
    }

    /// Fetch `url` over the network to its cache path, using the configured
    /// timeout and TLS-verification policy.
    async fn download(&self, url: &str) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DrahtwerkError::Fetch(e.to_string()))?;

        let bytes = response
            .bytes()
            .await
            .map_err(|e| DrahtwerkError::Fetch(e.to_string()))?;

        let path = self.path_for(url);
        tokio::fs::write(&path, &bytes).await?;
        info!(url, path = %path.display(), bytes = bytes.len(), "document downloaded");
        Ok(())
    }
}
