// Transport abstraction shared by the WebSocket link and in-process peers.
//
// A `Transport` knows how to reach one device: probe its identity over
// HTTP and open a persistent duplex `Link`. The link never interprets
// frames; it only moves them. All outbound frames funnel through a single
// writer so concurrent senders cannot interleave partial frames.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::info::DeviceInfo;

/// Outbound queue depth per link.
pub const OUTBOUND_CAPACITY: usize = 64;

/// Inbound queue depth per link.
pub const INBOUND_CAPACITY: usize = 256;

// ── Frames & events ──────────────────────────────────────────────────

/// One message-level frame off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// JSON text (RPC generation).
    Text(String),
    /// Opaque binary state blob (legacy generation).
    Binary(Bytes),
}

/// Everything a link reports to its reader.
///
/// After `Closed` or `Error` the link yields nothing further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(Frame),
    Closed,
    Error(String),
}

// ── FrameSender ──────────────────────────────────────────────────────

/// Cloneable handle that queues frames for the link's single writer.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<String>,
}

impl FrameSender {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    /// Queue a text frame. Fails once the link has shut down.
    pub async fn send(&self, text: String) -> Result<(), Error> {
        self.tx.send(text).await.map_err(|_| Error::LinkClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ── Link ─────────────────────────────────────────────────────────────

/// An open connection to one device.
pub struct Link {
    pub sender: FrameSender,
    pub events: mpsc::Receiver<TransportEvent>,
    closer: CancellationToken,
}

impl Link {
    pub fn new(
        sender: FrameSender,
        events: mpsc::Receiver<TransportEvent>,
        closer: CancellationToken,
    ) -> Self {
        Self {
            sender,
            events,
            closer,
        }
    }

    /// A link whose far end lives in this process.
    ///
    /// Used for simulators and tests: the returned [`MemoryPeer`] sees every
    /// frame the client sends and can inject frames, closes, and errors.
    pub fn in_memory() -> (Self, MemoryPeer) {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);
        let closer = CancellationToken::new();

        let link = Self::new(FrameSender::new(out_tx), in_rx, closer.clone());
        let peer = MemoryPeer {
            outbound: out_rx,
            inbound: in_tx,
            closer,
        };
        (link, peer)
    }

    /// Ask the link to shut down. Idempotent.
    pub fn close(&self) {
        self.closer.cancel();
    }

    /// Split into the pieces the session keeps separately.
    pub fn into_parts(self) -> (FrameSender, mpsc::Receiver<TransportEvent>, CancellationToken) {
        (self.sender, self.events, self.closer)
    }
}

/// Far end of an in-memory [`Link`].
pub struct MemoryPeer {
    outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<TransportEvent>,
    closer: CancellationToken,
}

impl MemoryPeer {
    /// Next frame the client sent, or `None` once the client is gone.
    pub async fn recv(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            frame = self.outbound.recv() => frame,
            () = self.closer.cancelled() => None,
        }
    }

    /// Deliver a text frame to the client.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), Error> {
        self.push(TransportEvent::Frame(Frame::Text(text.into())))
            .await
    }

    /// Deliver a binary frame to the client.
    pub async fn send_binary(&self, bytes: impl Into<Bytes>) -> Result<(), Error> {
        self.push(TransportEvent::Frame(Frame::Binary(bytes.into())))
            .await
    }

    /// Simulate the device hanging up.
    pub async fn hang_up(&self) -> Result<(), Error> {
        self.push(TransportEvent::Closed).await
    }

    /// Simulate a transport-level failure.
    pub async fn fail(&self, reason: impl Into<String>) -> Result<(), Error> {
        self.push(TransportEvent::Error(reason.into())).await
    }

    /// `true` once the client closed its side.
    pub fn is_closed_by_client(&self) -> bool {
        self.closer.is_cancelled()
    }

    async fn push(&self, event: TransportEvent) -> Result<(), Error> {
        self.inbound.send(event).await.map_err(|_| Error::LinkClosed)
    }
}

// ── Transport ────────────────────────────────────────────────────────

/// How to reach one device.
pub trait Transport: Send + Sync + 'static {
    /// Human-readable endpoint for logs (`host:port`).
    fn endpoint(&self) -> String;

    /// Fetch the device identity and auth requirements.
    fn probe(&self) -> BoxFuture<'_, Result<DeviceInfo, Error>>;

    /// Open a fresh persistent link.
    fn open(&self) -> BoxFuture<'_, Result<Link, Error>>;
}

// ── Tests ────────────────────────────────────────────────────────────
