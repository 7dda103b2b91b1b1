// SPDX-License-Identifier: MIT
//
// Print adapter on channel `/printer`.
//
// A client frame is a JSON [`PrintDocument`]; the adapter resolves it to a
// local file through the [`DocumentStore`], hands it to the spooler, and
// reports a [`PrintResult`] back on the same connection. The cached file is
// deleted once the job has been handed over.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use tokio::process::Command;
use tracing::{error, info, warn};

use drahtwerk_core::error::{DrahtwerkError, Result};
use drahtwerk_core::types::{JobId, PrintDocument, PrintResult};
use drahtwerk_document::DocumentStore;

use crate::services::BridgeService;
use crate::transport::{ChannelHandler, ClientHandle, Transport};

pub const PRINTER_CHANNEL: &str = "/printer";

/// Spooler seam. The production implementation shells out to `lp`; tests
/// record the hand-over.
#[async_trait]
pub trait PrintSpooler: Send + Sync + 'static {
    /// Hand a resolved file to the named printer queue.
    async fn spool(&self, printer: &str, file: &Path) -> Result<()>;

    /// Hand raw device bytes to the named printer queue.
    async fn spool_raw(&self, printer: &str, bytes: &[u8]) -> Result<()>;
}

/// CUPS spooler via the `lp` command line client.
pub struct LpSpooler;

impl LpSpooler {
    async fn run(command: &mut Command, printer: &str) -> Result<()> {
        let output = command.output().await.map_err(|e| {
            DrahtwerkError::Spool(format!("spawn lp for {printer}: {e}"))
        })?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(DrahtwerkError::Spool(format!(
                "lp for {printer} exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}

#[async_trait]
impl PrintSpooler for LpSpooler {
    async fn spool(&self, printer: &str, file: &Path) -> Result<()> {
        Self::run(Command::new("lp").arg("-d").arg(printer).arg(file), printer).await
    }

    async fn spool_raw(&self, printer: &str, bytes: &[u8]) -> Result<()> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        let mut child = Command::new("lp")
            .arg("-d")
            .arg(printer)
            .arg("-o")
            .arg("raw")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DrahtwerkError::Spool(format!("spawn lp for {printer}: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(bytes).await?;
        }
        let output = child.wait_with_output().await.map_err(|e| {
            DrahtwerkError::Spool(format!("wait for lp on {printer}: {e}"))
        })?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(DrahtwerkError::Spool(format!(
                "lp for {printer} exited with {}: {}",
                output.status,
                stderr.trim()
            )))
        }
    }
}

struct PrinterChannel {
    store: Arc<DocumentStore>,
    spooler: Arc<dyn PrintSpooler>,
}

impl PrinterChannel {
    async fn process(&self, document: &PrintDocument) -> Result<()> {
        self.store.resolve(document).await?;

        if document.has_raw_content() {
            let raw = document.raw_content.as_deref().unwrap_or_default();
            let bytes = BASE64.decode(raw)?;
            return self.spooler.spool_raw(&document.printer, &bytes).await;
        }

        // resolve() guarantees a URL beyond this point.
        let url = document.url.as_deref().unwrap_or_default();
        let file = self.store.file_for(url);
        let outcome = self.spooler.spool(&document.printer, &file).await;
        if let Err(e) = self.store.delete_file_for(url) {
            warn!(file = %file.display(), error = %e, "failed to delete cached document");
        }
        outcome
    }
}

#[async_trait]
impl ChannelHandler for PrinterChannel {
    async fn on_message(&self, client: ClientHandle, text: String) {
        let document: PrintDocument = match serde_json::from_str(&text) {
            Ok(document) => document,
            Err(e) => {
                warn!(error = %e, "discarding malformed print request");
                return;
            }
        };

        // Requests without an id still get a traceable one in the reply.
        let id = document
            .id
            .clone()
            .unwrap_or_else(|| JobId::new().to_string());
        info!(printer = %document.printer, id = %id, "print job received");
        let outcome = self.process(&document).await;
        let result = match &outcome {
            Ok(()) => PrintResult {
                id: Some(id.clone()),
                printer: document.printer.clone(),
                success: true,
                message: None,
                finished_at: Utc::now(),
            },
            Err(e) => {
                error!(printer = %document.printer, error = %e, "print job failed");
                PrintResult {
                    id: Some(id.clone()),
                    printer: document.printer.clone(),
                    success: false,
                    message: Some(e.to_string()),
                    finished_at: Utc::now(),
                }
            }
        };

        match serde_json::to_string(&result) {
            Ok(reply) => {
                if let Err(e) = client.send(reply).await {
                    warn!(error = %e, "could not deliver print result");
                }
            }
            Err(e) => error!(error = %e, "could not serialize print result"),
        }
    }
}

/// The channel adapter the supervisor registers once per generation.
pub struct PrinterService {
    store: Arc<DocumentStore>,
    spooler: Arc<dyn PrintSpooler>,
    transport: Arc<dyn Transport>,
}

impl PrinterService {
    pub fn new(
        store: Arc<DocumentStore>,
        spooler: Arc<dyn PrintSpooler>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            store,
            spooler,
            transport,
        }
    }
}

#[async_trait]
impl BridgeService for PrinterService {
    fn name(&self) -> &str {
        "printer"
    }

    async fn start(&mut self) -> Result<()> {
        self.transport.attach(
            PRINTER_CHANNEL,
            Arc::new(PrinterChannel {
                store: Arc::clone(&self.store),
                spooler: Arc::clone(&self.spooler),
            }),
        );
        info!(channel = PRINTER_CHANNEL, "printer adapter started");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use tokio_tungstenite::tungstenite::Message;

    use drahtwerk_core::config::DownloaderConfig;

    struct RecordingTransport {
        handlers: StdMutex<HashMap<String, Arc<dyn ChannelHandler>>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                handlers: StdMutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn attach(&self, channel: &str, handler: Arc<dyn ChannelHandler>) {
            self.handlers
                .lock()
                .unwrap()
                .insert(channel.to_string(), handler);
        }

        fn set_tls(&self, _acceptor: tokio_rustls::TlsAcceptor) {}

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn broadcast(&self, _channel: &str, _text: String) {}

        async fn close_connections(&self) {}

        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    enum SpoolCall {
        File(String, PathBuf),
        Raw(String, Vec<u8>),
    }

    struct RecordingSpooler {
        calls: StdMutex<Vec<SpoolCall>>,
    }

    impl RecordingSpooler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PrintSpooler for RecordingSpooler {
        async fn spool(&self, printer: &str, file: &Path) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(SpoolCall::File(printer.to_string(), file.to_path_buf()));
            Ok(())
        }

        async fn spool_raw(&self, printer: &str, bytes: &[u8]) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(SpoolCall::Raw(printer.to_string(), bytes.to_vec()));
            Ok(())
        }
    }

    async fn started(
        dir: &Path,
    ) -> (
        Arc<RecordingTransport>,
        Arc<RecordingSpooler>,
        Arc<dyn ChannelHandler>,
    ) {
        let transport = RecordingTransport::new();
        let spooler = RecordingSpooler::new();
        let store = Arc::new(
            DocumentStore::new(&DownloaderConfig {
                path: dir.to_path_buf(),
                ..DownloaderConfig::default()
            })
            .unwrap(),
        );
        let mut service =
            PrinterService::new(store, spooler.clone(), transport.clone());
        service.start().await.unwrap();
        let handler = transport
            .handlers
            .lock()
            .unwrap()
            .get(PRINTER_CHANNEL)
            .cloned()
            .unwrap();
        (transport, spooler, handler)
    }

    fn client() -> (ClientHandle, tokio::sync::mpsc::Receiver<Message>) {
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        (ClientHandle::new(1, tx), rx)
    }

    #[tokio::test]
    async fn inline_document_is_resolved_spooled_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let (_transport, spooler, handler) = started(dir.path()).await;
        let (client, mut rx) = client();

        let payload = BASE64.encode(b"%PDF-1.4 fake");
        let request = serde_json::json!({
            "printer": "front-desk",
            "url": "http://host/orders/receipt 1.pdf",
            "file_content": payload,
            "id": "5f2c1b34-0000-4000-8000-000000000001",
        });
        handler.on_message(client, request.to_string()).await;

        let calls = spooler.calls.lock().unwrap();
        let [SpoolCall::File(printer, file)] = calls.as_slice() else {
            panic!("expected exactly one file spool call");
        };
        assert_eq!(printer, "front-desk");
        assert_eq!(file, &dir.path().join("receipt%201.pdf"));
        // Cached file removed after the hand-over.
        assert!(!file.exists());

        let reply = rx.recv().await.unwrap();
        let Message::Text(reply) = reply else {
            panic!("expected a text reply");
        };
        let result: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["printer"], "front-desk");
        assert_eq!(result["id"], "5f2c1b34-0000-4000-8000-000000000001");
    }

    #[tokio::test]
    async fn missing_request_id_gets_a_generated_one() {
        let dir = tempfile::tempdir().unwrap();
        let (_transport, _spooler, handler) = started(dir.path()).await;
        let (client, mut rx) = client();

        let request = serde_json::json!({
            "printer": "labels",
            "raw_content": BASE64.encode(b"^XA^XZ"),
        });
        handler.on_message(client, request.to_string()).await;

        let Message::Text(reply) = rx.recv().await.unwrap() else {
            panic!("expected a text reply");
        };
        let result: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(result["success"], true);
        let id = result["id"].as_str().unwrap();
        assert!(!id.is_empty());
        uuid::Uuid::parse_str(id).unwrap();
    }

    #[tokio::test]
    async fn raw_content_bypasses_the_document_store() {
        let dir = tempfile::tempdir().unwrap();
        let (_transport, spooler, handler) = started(dir.path()).await;
        let (client, mut rx) = client();

        let request = serde_json::json!({
            "printer": "labels",
            "raw_content": BASE64.encode(b"^XA^FDhello^FS^XZ"),
        });
        handler.on_message(client, request.to_string()).await;

        let calls = spooler.calls.lock().unwrap();
        let [SpoolCall::Raw(printer, bytes)] = calls.as_slice() else {
            panic!("expected exactly one raw spool call");
        };
        assert_eq!(printer, "labels");
        assert_eq!(bytes, b"^XA^FDhello^FS^XZ");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let Message::Text(reply) = rx.recv().await.unwrap() else {
            panic!("expected a text reply");
        };
        let result: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(result["success"], true);
    }

    #[tokio::test]
    async fn contentless_document_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (_transport, spooler, handler) = started(dir.path()).await;
        let (client, mut rx) = client();

        let request = serde_json::json!({ "printer": "front-desk" });
        handler.on_message(client, request.to_string()).await;

        assert!(spooler.calls.lock().unwrap().is_empty());
        let Message::Text(reply) = rx.recv().await.unwrap() else {
            panic!("expected a text reply");
        };
        let result: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(result["success"], false);
        assert!(result["message"].as_str().unwrap().contains("document"));
    }

    #[tokio::test]
    async fn malformed_request_is_discarded_without_reply() {
        let dir = tempfile::tempdir().unwrap();
        let (_transport, spooler, handler) = started(dir.path()).await;
        let (client, mut rx) = client();

        handler.on_message(client, "not json".into()).await;

        assert!(spooler.calls.lock().unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }
}
