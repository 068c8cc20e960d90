//! WebSocket link to a device's `/rpc` endpoint.
//!
//! [`WsTransport`] probes the device over HTTP and opens persistent
//! WebSocket links. Each link runs one pump task that owns both halves of
//! the socket: it drains the outbound queue (the single writer), forwards
//! inbound frames as [`TransportEvent`]s, and reports the end of the link
//! exactly once.
//!
//! # Example
//!
//! ```rust,ignore
//! use shelly_api::websocket::WsTransport;
//! use shelly_api::transport::Transport;
//!
//! let transport = WsTransport::new("192.168.1.40", 80, Duration::from_secs(10))?;
//! let info = transport.probe().await?;
//! let link = transport.open().await?;
//! ```

use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::info::{self, DeviceInfo};
use crate::transport::{
    Frame, FrameSender, INBOUND_CAPACITY, Link, OUTBOUND_CAPACITY, Transport, TransportEvent,
};

const RPC_PATH: &str = "/rpc";

// ── WsTransport ──────────────────────────────────────────────────────

/// WebSocket + HTTP transport for one RPC-generation device.
#[derive(Debug, Clone)]
pub struct WsTransport {
    host: String,
    port: u16,
    http: reqwest::Client,
    base_url: Url,
    connect_timeout: Duration,
    expected_mac: Option<String>,
}

impl WsTransport {
    pub fn new(host: &str, port: u16, connect_timeout: Duration) -> Result<Self, Error> {
        Ok(Self {
            host: host.to_owned(),
            port,
            http: info::build_http_client(connect_timeout)?,
            base_url: info::device_base_url(host, port)?,
            connect_timeout,
            expected_mac: None,
        })
    }

    /// Refuse devices whose reported MAC differs from this one.
    pub fn with_expected_mac(mut self, mac: Option<String>) -> Self {
        self.expected_mac = mac;
        self
    }

    fn ws_url(&self) -> String {
        format!("ws://{}:{}{RPC_PATH}", self.host, self.port)
    }

    async fn connect(&self) -> Result<Link, Error> {
        let url = self.ws_url();
        tracing::info!(url = %url, "Connecting to WebSocket");

        let uri: tungstenite::http::Uri = url.parse().map_err(
            |e: tungstenite::http::uri::InvalidUri| Error::Connect {
                host: self.endpoint(),
                reason: e.to_string(),
            },
        )?;
        let request = ClientRequestBuilder::new(uri);

        let (ws_stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| Error::Connect {
                    host: self.endpoint(),
                    reason: format!("timed out after {}ms", self.connect_timeout.as_millis()),
                })?
                .map_err(|e| Error::Connect {
                    host: self.endpoint(),
                    reason: e.to_string(),
                })?;

        tracing::info!(endpoint = %self.endpoint(), "WebSocket connected");

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let closer = CancellationToken::new();

        tokio::spawn(pump(ws_stream, out_rx, in_tx, closer.clone()));

        Ok(Link::new(FrameSender::new(out_tx), in_rx, closer))
    }
}

impl Transport for WsTransport {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn probe(&self) -> BoxFuture<'_, Result<DeviceInfo, Error>> {
        Box::pin(info::fetch_device_info(
            &self.http,
            &self.base_url,
            self.expected_mac.as_deref(),
        ))
    }

    fn open(&self) -> BoxFuture<'_, Result<Link, Error>> {
        Box::pin(self.connect())
    }
}

// ── Link pump ────────────────────────────────────────────────────────

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Move frames between the socket and the link queues until either side
/// goes away. Emits exactly one terminal event unless the client closed.
async fn pump(
    ws_stream: WsStream,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<TransportEvent>,
    closer: CancellationToken,
) {
    let (mut write, mut read) = ws_stream.split();

    let terminal = loop {
        tokio::select! {
            biased;
            () = closer.cancelled() => {
                let _ = write.send(tungstenite::Message::Close(None)).await;
                break None;
            }
            queued = outbound.recv() => {
                let Some(text) = queued else {
                    // Every sender dropped: nobody can use this link again.
                    let _ = write.send(tungstenite::Message::Close(None)).await;
                    break None;
                };
                tracing::trace!(len = text.len(), "WebSocket send");
                if let Err(e) = write.send(tungstenite::Message::Text(text.into())).await {
                    break Some(TransportEvent::Error(e.to_string()));
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        let event = TransportEvent::Frame(Frame::Text(text.as_str().to_owned()));
                        if inbound.send(event).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(tungstenite::Message::Binary(bytes))) => {
                        if inbound.send(TransportEvent::Frame(Frame::Binary(bytes))).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(_))) => {
                        // tungstenite handles pong replies automatically
                        tracing::trace!("WebSocket ping");
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        if let Some(ref cf) = frame {
                            tracing::info!(
                                code = %cf.code,
                                reason = %cf.reason,
                                "WebSocket close frame received"
                            );
                        } else {
                            tracing::info!("WebSocket close frame received (no payload)");
                        }
                        break Some(TransportEvent::Closed);
                    }
                    Some(Err(e)) => break Some(TransportEvent::Error(e.to_string())),
                    None => {
                        tracing::info!("WebSocket stream ended");
                        break Some(TransportEvent::Closed);
                    }
                    _ => {
                        // Pong, raw Frame -- ignore
                    }
                }
            }
        }
    };

    if let Some(event) = terminal {
        let _ = inbound.send(event).await;
    }
    closer.cancel();
    tracing::debug!("WebSocket pump exiting");
}

// ── Tests ────────────────────────────────────────────────────────────
