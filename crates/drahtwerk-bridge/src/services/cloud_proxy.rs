// SPDX-License-Identifier: MIT
//
// Cloud proxy adapter.
//
// Dials the configured cloud endpoint over WebSocket and relays frames
// between it and the local channels. Frames arriving from the cloud are
// JSON envelopes naming the target channel; frames local clients send to
// `/cloud` are wrapped in the same envelope on the way up. A failed dial
// or dropped link is logged and the relay ends; there is no reconnect.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use drahtwerk_core::error::Result;

use crate::services::BridgeService;
use crate::transport::{ChannelHandler, ClientHandle, Transport};

pub const CLOUD_CHANNEL: &str = "/cloud";

/// Frame wrapper on the cloud link.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    channel: String,
    payload: String,
}

struct CloudChannel {
    uplink: mpsc::Sender<Envelope>,
}

#[async_trait]
impl ChannelHandler for CloudChannel {
    async fn on_message(&self, _client: ClientHandle, text: String) {
        let envelope = Envelope {
            channel: CLOUD_CHANNEL.to_string(),
            payload: text,
        };
        if self.uplink.send(envelope).await.is_err() {
            warn!("cloud link is down, dropping upstream frame");
        }
    }
}

pub struct CloudProxyService {
    url: String,
    transport: Arc<dyn Transport>,
    relay: Option<JoinHandle<()>>,
}

impl CloudProxyService {
    pub fn new(url: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            url: url.to_string(),
            transport,
            relay: None,
        }
    }
}

#[async_trait]
impl BridgeService for CloudProxyService {
    fn name(&self) -> &str {
        "cloud-proxy"
    }

    async fn start(&mut self) -> Result<()> {
        let (uplink_tx, mut uplink_rx) = mpsc::channel::<Envelope>(32);
        self.transport
            .attach(CLOUD_CHANNEL, Arc::new(CloudChannel { uplink: uplink_tx }));

        let url = self.url.clone();
        let transport = Arc::clone(&self.transport);
        self.relay = Some(tokio::spawn(async move {
            let (ws, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok(connected) => connected,
                Err(e) => {
                    error!(url = %url, error = %e, "cloud proxy dial failed");
                    return;
                }
            };
            info!(url = %url, "cloud proxy connected");
            let (mut ws_tx, mut ws_rx) = ws.split();

            loop {
                tokio::select! {
                    upstream = uplink_rx.recv() => {
                        let Some(envelope) = upstream else { break };
                        let frame = match serde_json::to_string(&envelope) {
                            Ok(frame) => frame,
                            Err(e) => {
                                error!(error = %e, "could not serialize upstream envelope");
                                continue;
                            }
                        };
                        if let Err(e) = ws_tx.send(
                            tokio_tungstenite::tungstenite::Message::Text(frame),
                        ).await {
                            warn!(error = %e, "cloud link dropped");
                            break;
                        }
                    }

                    downstream = ws_rx.next() => {
                        match downstream {
                            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(frame))) => {
                                match serde_json::from_str::<Envelope>(&frame) {
                                    Ok(envelope) => {
                                        transport
                                            .broadcast(&envelope.channel, envelope.payload)
                                            .await;
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "discarding malformed cloud frame");
                                    }
                                }
                            }
                            Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => {
                                info!(url = %url, "cloud link closed");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(url = %url, error = %e, "cloud link error");
                                break;
                            }
                        }
                    }
                }
            }
        }));

        info!(url = %self.url, "cloud proxy adapter started");
        Ok(())
    }
}

impl Drop for CloudProxyService {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    struct RecordingTransport {
        handlers: StdMutex<HashMap<String, Arc<dyn ChannelHandler>>>,
        broadcasts: StdMutex<Vec<(String, String)>>,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                handlers: StdMutex::new(HashMap::new()),
                broadcasts: StdMutex::new(Vec::new()),
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

        async fn broadcast(&self, channel: &str, text: String) {
            self.broadcasts
                .lock()
                .unwrap()
                .push((channel.to_string(), text));
        }

        async fn close_connections(&self) {}

        async fn stop(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Fake cloud endpoint: accepts one WebSocket connection.
    async fn fake_cloud() -> (String, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (url, listener)
    }

    #[tokio::test]
    async fn cloud_envelopes_are_broadcast_on_their_channel() {
        let (url, listener) = fake_cloud().await;
        let transport = RecordingTransport::new();
        let mut service = CloudProxyService::new(&url, transport.clone());
        service.start().await.unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut cloud = accept_async(stream).await.unwrap();
        cloud
            .send(Message::Text(
                r#"{"channel":"/serial/scale","payload":"TARE"}"#.into(),
            ))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let broadcasts = transport.broadcasts.lock().unwrap().clone();
        assert_eq!(
            broadcasts,
            [("/serial/scale".to_string(), "TARE".to_string())]
        );
    }

    #[tokio::test]
    async fn local_frames_go_up_wrapped_in_an_envelope() {
        let (url, listener) = fake_cloud().await;
        let transport = RecordingTransport::new();
        let mut service = CloudProxyService::new(&url, transport.clone());
        service.start().await.unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut cloud = accept_async(stream).await.unwrap();

        let handler = transport
            .handlers
            .lock()
            .unwrap()
            .get(CLOUD_CHANNEL)
            .cloned()
            .expect("cloud channel attached");
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        handler
            .on_message(ClientHandle::new(1, tx), "job done".into())
            .await;

        let Message::Text(frame) = cloud.next().await.unwrap().unwrap() else {
            panic!("expected a text frame");
        };
        let envelope: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(envelope["channel"], CLOUD_CHANNEL);
        assert_eq!(envelope["payload"], "job done");
    }

    #[tokio::test]
    async fn failed_dial_is_not_fatal() {
        // TEST-NET port that nothing listens on.
        let transport = RecordingTransport::new();
        let mut service = CloudProxyService::new("ws://127.0.0.1:1/", transport);
        assert!(service.start().await.is_ok());
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
