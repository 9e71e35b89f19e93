//! Client side of the Ricochet stream correlation layer.
//!
//! Every outgoing message rides its own transport stream: [`ClientSession::send`]
//! allocates a stream, parks a single-resolution waiter under that stream's
//! identifier, writes the message, and suspends until the matching
//! response event resumes the waiter or the response timeout expires. The
//! event pump runs concurrently on the same connection, so responses may
//! arrive in any order; each resolves only the request whose stream
//! identifier it carries.

mod driver;

pub use driver::{run_message_sequence, MessageOutcome, SequenceReport};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rico_core::{
    connect, LinkError, LinkEvent, LinkHandle, PeerVerification, QuicConnectConfig,
    QuicSetupError, StreamId,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("transport setup failed: {0}")]
    Setup(#[from] QuicSetupError),
    #[error("no response on stream {stream} within the timeout")]
    ResponseTimeout { stream: StreamId },
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    #[error("stream {0} already has a pending request")]
    StreamReused(StreamId),
    #[error("response payload was not valid UTF-8")]
    MalformedResponse,
}

/// Receives lifecycle events the correlation layer does not consume itself.
///
/// The pump handles `StreamData` and forwards every other event kind here
/// untouched, so callers compose their own lifecycle handling instead of
/// overriding the dispatch path.
pub trait ConnectionObserver: Send + Sync + std::fmt::Debug {
    fn on_event(&self, event: &LinkEvent);
}

/// Default observer that forwards lifecycle events to the tracing subsystem.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl ConnectionObserver for TracingObserver {
    fn on_event(&self, event: &LinkEvent) {
        match event {
            LinkEvent::HandshakeConfirmed => {
                debug!(target: "ricochet::client", "transport handshake confirmed");
            }
            LinkEvent::Closed { reason } => {
                info!(target: "ricochet::client", %reason, "connection closed");
            }
            LinkEvent::StreamData { .. } => {}
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: SocketAddr,
    pub server_name: String,
    pub alpn_protocols: Vec<String>,
    pub verification: PeerVerification,
    pub response_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            server_name: "localhost".to_string(),
            alpn_protocols: vec!["http/1.1".to_string()],
            verification: PeerVerification::SkipDangerous,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_verification(mut self, verification: PeerVerification) -> Self {
        self.verification = verification;
        self
    }

    pub fn with_alpn_protocols<I, S>(mut self, alpns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alpn_protocols = alpns.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 4433)))
    }
}

pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Establish the transport connection and wrap it in a session.
    pub async fn connect(&self) -> Result<ClientSession, ClientError> {
        let link_config = QuicConnectConfig::new(self.config.server_addr, &self.config.server_name)
            .with_verification(self.config.verification.clone())
            .with_alpn_protocols(self.config.alpn_protocols.iter().cloned());
        let link = connect(link_config).await?;
        info!(
            target: "ricochet::client",
            remote = %self.config.server_addr,
            "connection established"
        );
        Ok(ClientSession::over_link(
            link,
            self.config.response_timeout,
            Arc::new(TracingObserver),
        ))
    }
}

type PendingTable = Arc<DashMap<StreamId, oneshot::Sender<Bytes>>>;

/// One connection's correlation state: the pending-request table plus the
/// pump task that resolves waiters from transport events.
pub struct ClientSession {
    link: LinkHandle,
    pending: PendingTable,
    response_timeout: Duration,
    pump: JoinHandle<()>,
}

impl ClientSession {
    /// Build a session over an already-established link. Exposed so tests and
    /// embedders can run the correlation layer over any [`StreamLink`].
    ///
    /// [`StreamLink`]: rico_core::StreamLink
    pub fn over_link(
        link: LinkHandle,
        response_timeout: Duration,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        let pending: PendingTable = Arc::new(DashMap::new());
        let pump = tokio::spawn(pump_events(
            Arc::clone(&link),
            Arc::clone(&pending),
            observer,
        ));
        Self {
            link,
            pending,
            response_timeout,
            pump,
        }
    }

    /// Send one message and await its response.
    ///
    /// Exactly one stream is opened and one write performed per call, and the
    /// pending-request entry is inserted and removed exactly once no matter
    /// which path resolves it: matching response, timeout, write failure, or
    /// connection teardown. A timeout surfaces as
    /// [`ClientError::ResponseTimeout`]; a late response for the same stream
    /// is discarded by the pump without effect.
    pub async fn send(&self, message: &[u8]) -> Result<Bytes, ClientError> {
        let stream = self.link.open_stream().await?;
        let (waiter, mut response) = oneshot::channel();
        match self.pending.entry(stream) {
            Entry::Occupied(_) => return Err(ClientError::StreamReused(stream)),
            Entry::Vacant(slot) => {
                slot.insert(waiter);
            }
        }

        if let Err(err) = self.link.send(stream, message).await {
            self.pending.remove(&stream);
            return Err(err.into());
        }
        debug!(
            target: "ricochet::client",
            stream,
            len = message.len(),
            "request issued"
        );

        match time::timeout(self.response_timeout, &mut response).await {
            Ok(Ok(payload)) => Ok(payload),
            // Waiter dropped without resolution: the table was drained on
            // connection teardown.
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_elapsed) => {
                if self.pending.remove(&stream).is_some() {
                    warn!(
                        target: "ricochet::client",
                        stream,
                        "no response within the timeout"
                    );
                    Err(ClientError::ResponseTimeout { stream })
                } else {
                    // The event path claimed the waiter in the race window;
                    // its resolution is already in flight.
                    match response.await {
                        Ok(payload) => Ok(payload),
                        Err(_) => Err(ClientError::ConnectionClosed),
                    }
                }
            }
        }
    }

    /// [`send`](Self::send) with UTF-8 payloads on both sides.
    pub async fn send_text(&self, message: &str) -> Result<String, ClientError> {
        let payload = self.send(message.as_bytes()).await?;
        String::from_utf8(payload.to_vec()).map_err(|_| ClientError::MalformedResponse)
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_events(
    link: LinkHandle,
    pending: PendingTable,
    observer: Arc<dyn ConnectionObserver>,
) {
    loop {
        match link.next_event().await {
            Ok(LinkEvent::StreamData { stream, payload }) => {
                resolve_pending(&pending, stream, payload);
            }
            Ok(event @ LinkEvent::Closed { .. }) => {
                observer.on_event(&event);
                // Dropping the waiters resumes every suspended caller with a
                // connection-closed outcome instead of leaking them.
                pending.clear();
                break;
            }
            Ok(event) => observer.on_event(&event),
            Err(_) => {
                pending.clear();
                break;
            }
        }
    }
}

fn resolve_pending(pending: &DashMap<StreamId, oneshot::Sender<Bytes>>, stream: StreamId, payload: Bytes) {
    match pending.remove(&stream) {
        Some((_, waiter)) => {
            // A failed send means the caller just raced its timeout and gave
            // up between removal and resolution; nothing to do.
            let _ = waiter.send(payload);
        }
        None => {
            debug!(
                target: "ricochet::client",
                stream,
                "response without a pending request discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rico_core::{memory_link_pair, StreamLink};

    fn session_over(link: LinkHandle, timeout: Duration) -> ClientSession {
        ClientSession::over_link(link, timeout, Arc::new(TracingObserver))
    }

    /// Peer that answers every request with a fixed prefix.
    fn spawn_echo_peer(link: LinkHandle) {
        tokio::spawn(async move {
            while let Ok(event) = link.next_event().await {
                if let LinkEvent::StreamData { stream, payload } = event {
                    let mut reply = b"echo: ".to_vec();
                    reply.extend_from_slice(&payload);
                    if link.send(stream, &reply).await.is_err() {
                        break;
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn send_returns_matching_response_and_clears_table() {
        let (client_link, server_link) = memory_link_pair(8);
        spawn_echo_peer(server_link);
        let session = session_over(client_link, Duration::from_secs(1));

        let response = session.send(b"ping").await.expect("response");
        assert_eq!(&response[..], b"echo: ping");
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn responses_route_by_stream_id_even_out_of_order() {
        let (client_link, server_link) = memory_link_pair(8);
        // Collect both requests, then answer them in reverse order.
        tokio::spawn({
            let link = Arc::clone(&server_link);
            async move {
                let mut inbox = Vec::new();
                while inbox.len() < 2 {
                    match link.next_event().await {
                        Ok(LinkEvent::StreamData { stream, payload }) => {
                            inbox.push((stream, payload));
                        }
                        Ok(_) => continue,
                        Err(_) => return,
                    }
                }
                for (stream, payload) in inbox.into_iter().rev() {
                    let mut reply = b"echo: ".to_vec();
                    reply.extend_from_slice(&payload);
                    link.send(stream, &reply).await.unwrap();
                }
            }
        });
        let session = session_over(client_link, Duration::from_secs(1));

        let (first, second) = tokio::join!(session.send(b"first"), session.send(b"second"));
        assert_eq!(&first.expect("first response")[..], b"echo: first");
        assert_eq!(&second.expect("second response")[..], b"echo: second");
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn timeout_surfaces_typed_error_and_removes_entry() {
        let (client_link, server_link) = memory_link_pair(8);
        // Peer that reads requests but never answers.
        tokio::spawn(async move { while server_link.next_event().await.is_ok() {} });
        let session = session_over(client_link, Duration::from_millis(50));

        let err = session.send(b"anyone").await.unwrap_err();
        assert!(matches!(err, ClientError::ResponseTimeout { .. }));
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn late_response_after_timeout_is_discarded() {
        let (client_link, server_link) = memory_link_pair(8);
        // First request is answered far too late, the second promptly.
        tokio::spawn({
            let link = Arc::clone(&server_link);
            async move {
                let mut delayed = true;
                while let Ok(event) = link.next_event().await {
                    if let LinkEvent::StreamData { stream, payload } = event {
                        if delayed {
                            delayed = false;
                            time::sleep(Duration::from_millis(200)).await;
                        }
                        let mut reply = b"echo: ".to_vec();
                        reply.extend_from_slice(&payload);
                        if link.send(stream, &reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        let session = session_over(client_link, Duration::from_millis(50));

        let err = session.send(b"slow").await.unwrap_err();
        assert!(matches!(err, ClientError::ResponseTimeout { .. }));

        // Let the stale response arrive; the pump must discard it silently.
        time::sleep(Duration::from_millis(250)).await;
        assert_eq!(session.pending_requests(), 0);

        let response = session.send(b"fast").await.expect("second request");
        assert_eq!(&response[..], b"echo: fast");
    }

    #[tokio::test]
    async fn connection_teardown_resumes_pending_callers() {
        let (client_link, server_link) = memory_link_pair(8);
        tokio::spawn(async move {
            // Swallow the request, then vanish.
            let _ = server_link.next_event().await;
            drop(server_link);
        });
        let session = session_over(client_link, Duration::from_secs(5));

        let err = session.send(b"hello").await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn spurious_event_leaves_session_intact() {
        let (client_link, server_link) = memory_link_pair(8);
        server_link.send(999, b"nobody asked").await.unwrap();
        spawn_echo_peer(server_link);
        let session = session_over(client_link, Duration::from_secs(1));

        let response = session.send(b"real").await.expect("response");
        assert_eq!(&response[..], b"echo: real");
        assert_eq!(session.pending_requests(), 0);
    }

    /// Link double whose stream allocator is stuck on one identifier.
    #[derive(Debug, Default)]
    struct FixedIdLink;

    #[async_trait]
    impl StreamLink for FixedIdLink {
        async fn open_stream(&self) -> Result<StreamId, LinkError> {
            Ok(0)
        }

        async fn send(&self, _stream: StreamId, _payload: &[u8]) -> Result<(), LinkError> {
            Ok(())
        }

        async fn next_event(&self) -> Result<LinkEvent, LinkError> {
            std::future::pending::<()>().await;
            Err(LinkError::Closed)
        }
    }

    #[tokio::test]
    async fn duplicate_registration_for_one_stream_is_rejected() {
        let session = Arc::new(session_over(
            Arc::new(FixedIdLink),
            Duration::from_secs(60),
        ));
        let background = {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let _ = session.send(b"first").await;
            })
        };
        time::sleep(Duration::from_millis(20)).await;

        let err = session.send(b"second").await.unwrap_err();
        assert!(matches!(err, ClientError::StreamReused(0)));
        assert_eq!(session.pending_requests(), 1);
        background.abort();
    }
}
