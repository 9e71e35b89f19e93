use crate::event::{LinkEvent, StreamId};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Largest message accepted on a single stream, in bytes.
///
/// Matches the reference transport's 64 KiB datagram ceiling; a stream carries
/// exactly one message in each direction.
pub const MESSAGE_MAX: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,
    #[error("stream {0} is not writable on this link")]
    UnknownStream(StreamId),
    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("transport error: {0}")]
    Transport(String),
}

/// The narrow interface through which the correlation layer consumes the
/// multiplexed transport: allocate a stream, write one message on it, and
/// observe delivery as a sequence of [`LinkEvent`]s.
#[async_trait]
pub trait StreamLink: Send + Sync {
    /// Allocate the identifier of the next outbound stream.
    async fn open_stream(&self) -> Result<StreamId, LinkError>;

    /// Write `payload` as the complete message of `stream`.
    async fn send(&self, stream: StreamId, payload: &[u8]) -> Result<(), LinkError>;

    /// Receive the next transport event. Returns [`LinkError::Closed`] once
    /// the connection is gone and its final event has been drained.
    async fn next_event(&self) -> Result<LinkEvent, LinkError>;
}

pub type LinkHandle = Arc<dyn StreamLink>;

/// In-process link endpoint backed by channels. Each endpoint allocates its
/// own stream identifiers; a message sent on a stream surfaces at the peer as
/// a [`LinkEvent::StreamData`] carrying the same identifier.
#[derive(Clone)]
pub struct ChannelLink {
    peer_tx: mpsc::Sender<LinkEvent>,
    events: Arc<Mutex<mpsc::Receiver<LinkEvent>>>,
    next_stream: Arc<AtomicU64>,
}

impl ChannelLink {
    fn new(peer_tx: mpsc::Sender<LinkEvent>, events: mpsc::Receiver<LinkEvent>, first: u64) -> Self {
        Self {
            peer_tx,
            events: Arc::new(Mutex::new(events)),
            next_stream: Arc::new(AtomicU64::new(first)),
        }
    }
}

#[async_trait]
impl StreamLink for ChannelLink {
    async fn open_stream(&self) -> Result<StreamId, LinkError> {
        Ok(self.next_stream.fetch_add(4, Ordering::Relaxed))
    }

    async fn send(&self, stream: StreamId, payload: &[u8]) -> Result<(), LinkError> {
        if payload.len() > MESSAGE_MAX {
            return Err(LinkError::MessageTooLarge {
                size: payload.len(),
                limit: MESSAGE_MAX,
            });
        }
        self.peer_tx
            .send(LinkEvent::StreamData {
                stream,
                payload: Bytes::copy_from_slice(payload),
            })
            .await
            .map_err(|_| LinkError::Closed)
    }

    async fn next_event(&self) -> Result<LinkEvent, LinkError> {
        let mut events = self.events.lock().await;
        events.recv().await.ok_or(LinkError::Closed)
    }
}

/// Build a connected pair of in-process links. The first endpoint numbers its
/// streams 0, 4, 8, ... and the second 1, 5, 9, ..., mirroring QUIC's
/// initiator-based spacing.
pub fn memory_link_pair(capacity: usize) -> (LinkHandle, LinkHandle) {
    let (tx_ab, rx_ab) = mpsc::channel(capacity);
    let (tx_ba, rx_ba) = mpsc::channel(capacity);

    let endpoint_a: LinkHandle = Arc::new(ChannelLink::new(tx_ab, rx_ba, 0));
    let endpoint_b: LinkHandle = Arc::new(ChannelLink::new(tx_ba, rx_ab, 1));

    (endpoint_a, endpoint_b)
}
