// SPDX-License-Identifier: MIT
//
// Serial device adapter.
//
// Each configured descriptor gets its own adapter on channel
// `/serial/{key}`: lines read from the device are broadcast to every
// attached client, and client frames are written back to the device.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use drahtwerk_core::config::SerialConfig;
use drahtwerk_core::error::{DrahtwerkError, Result};

use crate::transport::{ChannelHandler, ClientHandle, Transport};
use crate::services::BridgeService;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Open handles to one serial device.
pub struct SerialPipes {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

/// Device access seam. The production link opens a device node path; tests
/// inject in-memory pipes.
#[async_trait]
pub trait SerialLink: Send + Sync + 'static {
    async fn open(&self) -> Result<SerialPipes>;
}

/// Opens the device node twice, once per direction, so a blocked reader
/// never stalls writes.
pub struct DevicePathLink {
    path: PathBuf,
}

impl DevicePathLink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SerialLink for DevicePathLink {
    async fn open(&self) -> Result<SerialPipes> {
        let reader = tokio::fs::OpenOptions::new()
            .read(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                DrahtwerkError::ServiceStart(format!(
                    "open {} for reading: {e}",
                    self.path.display()
                ))
            })?;
        let writer = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .map_err(|e| {
                DrahtwerkError::ServiceStart(format!(
                    "open {} for writing: {e}",
                    self.path.display()
                ))
            })?;
        Ok(SerialPipes {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

struct SerialChannel {
    name: String,
    writer: Arc<Mutex<BoxedWriter>>,
}

#[async_trait]
impl ChannelHandler for SerialChannel {
    async fn on_message(&self, _client: ClientHandle, text: String) {
        debug!(device = %self.name, bytes = text.len(), "writing frame to device");
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(text.as_bytes()).await {
            error!(device = %self.name, error = %e, "device write failed");
            return;
        }
        if let Err(e) = writer.write_all(b"\n").await {
            error!(device = %self.name, error = %e, "device write failed");
        }
    }
}

/// One adapter per configured descriptor.
pub struct SerialService {
    name: String,
    key: String,
    link: Arc<dyn SerialLink>,
    transport: Arc<dyn Transport>,
    pump: Option<JoinHandle<()>>,
}

impl SerialService {
    pub fn new(descriptor: &SerialConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_link(
            descriptor,
            Arc::new(DevicePathLink::new(&descriptor.name)),
            transport,
        )
    }

    /// Construct with an injected device link (tests).
    pub fn with_link(
        descriptor: &SerialConfig,
        link: Arc<dyn SerialLink>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            name: descriptor.name.clone(),
            key: descriptor.key.clone(),
            link,
            transport,
            pump: None,
        }
    }

    pub fn channel(&self) -> String {
        format!("/serial/{}", self.key)
    }
}

#[async_trait]
impl BridgeService for SerialService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        let pipes = self.link.open().await?;
        let channel = self.channel();

        self.transport.attach(
            &channel,
            Arc::new(SerialChannel {
                name: self.name.clone(),
                writer: Arc::new(Mutex::new(pipes.writer)),
            }),
        );

        // Read pump: every device line goes out to the channel.
        let transport = Arc::clone(&self.transport);
        let name = self.name.clone();
        let mut lines = BufReader::new(pipes.reader).lines();
        self.pump = Some(tokio::spawn(async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        debug!(device = %name, bytes = line.len(), "device frame");
                        transport.broadcast(&channel, line).await;
                    }
                    Ok(None) => {
                        warn!(device = %name, "device closed");
                        break;
                    }
                    Err(e) => {
                        error!(device = %name, error = %e, "device read failed");
                        break;
                    }
                }
            }
        }));

        info!(device = %self.name, key = %self.key, "serial adapter started");
        Ok(())
    }
}

impl Drop for SerialService {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
