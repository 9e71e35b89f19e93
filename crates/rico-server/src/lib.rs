//! Server side of the Ricochet correlation layer.
//!
//! The server never initiates correlation: every received message already
//! names the stream it arrived on, and the reply goes back out on that same
//! stream. There is no waiter table here — only an event loop per connection
//! applying a pure transform to each payload. Connections are fully
//! independent; nothing is shared between their handlers.

use rico_core::{
    server_endpoint, LinkEvent, LinkHandle, LinkRole, QuicLink, QuicSetupError,
};
use rico_identity::{generate_identity, Identity, IdentityError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const DEFAULT_MAX_CONNECTIONS: usize = 256;
const DEFAULT_VALIDITY_DAYS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("identity bootstrap failed: {0}")]
    Identity(#[from] IdentityError),
    #[error("transport setup failed: {0}")]
    Setup(#[from] QuicSetupError),
    #[error("incoming connection failed: {0}")]
    Accept(String),
    #[error("server endpoint is shutting down")]
    Shutdown,
}

/// Builder-style server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub hostname: String,
    pub validity_days: u32,
    pub alpn_protocols: Vec<String>,
    pub max_connections: usize,
    pub idle_timeout: Duration,
}

impl ServerConfig {
    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
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

    /// Bound the number of connections handled in parallel.
    pub fn with_max_connections(mut self, limit: usize) -> Self {
        self.max_connections = limit.max(1);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 4433)),
            hostname: "localhost".to_string(),
            validity_days: DEFAULT_VALIDITY_DAYS,
            alpn_protocols: vec!["http/1.1".to_string()],
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Pure request-to-response transformation applied per received message.
pub trait MessageTransform: Send + Sync + 'static {
    fn apply(&self, payload: &[u8]) -> Vec<u8>;
}

impl<F> MessageTransform for F
where
    F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
{
    fn apply(&self, payload: &[u8]) -> Vec<u8> {
        (self)(payload)
    }
}

/// The reference transform: prefix decoded text so the response carries the
/// request verbatim. Payloads that do not decode as UTF-8 are logged and
/// echoed back unchanged rather than faulting the connection.
#[derive(Debug, Clone)]
pub struct EchoTransform {
    prefix: String,
}

impl EchoTransform {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for EchoTransform {
    fn default() -> Self {
        Self::new("server received: ")
    }
}

impl MessageTransform for EchoTransform {
    fn apply(&self, payload: &[u8]) -> Vec<u8> {
        match std::str::from_utf8(payload) {
            Ok(text) => format!("{}{}", self.prefix, text).into_bytes(),
            Err(_) => {
                warn!(
                    target: "ricochet::server",
                    len = payload.len(),
                    "undecodable payload echoed raw"
                );
                payload.to_vec()
            }
        }
    }
}

/// Listening endpoint with a freshly bootstrapped identity.
pub struct Server {
    endpoint: quinn::Endpoint,
    identity: Identity,
    semaphore: Arc<Semaphore>,
}

impl Server {
    /// Generate the identity and bind the transport endpoint.
    ///
    /// Must be called from within a tokio runtime; the endpoint registers its
    /// socket with the running reactor.
    pub fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let identity = generate_identity(&config.hostname, config.validity_days)?;
        let endpoint = server_endpoint(
            config.listen,
            identity.certificate_der(),
            identity.private_key_der(),
            &config.alpn_protocols,
            config.idle_timeout,
        )?;
        let listen = endpoint.local_addr()?;
        info!(
            target: "ricochet::server",
            %listen,
            hostname = %config.hostname,
            "server listening"
        );
        Ok(Self {
            endpoint,
            identity,
            semaphore: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    /// The bootstrapped credential serving this endpoint.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Socket address the endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Accept one connection and wrap it for event handling.
    pub async fn accept(&self) -> Result<ServerConnection, ServerError> {
        let incoming = self.endpoint.accept().await.ok_or(ServerError::Shutdown)?;
        let connection = incoming
            .await
            .map_err(|err| ServerError::Accept(err.to_string()))?;
        let remote = connection.remote_address();
        info!(target: "ricochet::server", %remote, "connection accepted");
        Ok(ServerConnection {
            link: QuicLink::new(connection, LinkRole::Server),
            remote: Some(remote),
        })
    }

    /// Accept connections forever, running each one's event loop in its own
    /// task until the peer goes away.
    pub async fn serve<T: MessageTransform>(&self, transform: T) -> Result<(), ServerError> {
        let transform = Arc::new(transform);
        loop {
            let connection = match self.accept().await {
                Ok(connection) => connection,
                Err(ServerError::Shutdown) => return Err(ServerError::Shutdown),
                Err(err) => {
                    warn!(target: "ricochet::server", error = %err, "incoming connection rejected");
                    continue;
                }
            };

            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| ServerError::Shutdown)?;
            let transform = Arc::clone(&transform);
            tokio::spawn(async move {
                let remote = connection.remote();
                if let Err(err) = connection.run(transform.as_ref()).await {
                    warn!(
                        target: "ricochet::server",
                        remote = ?remote,
                        error = %err,
                        "connection handling failed"
                    );
                }
                drop(permit);
            });
        }
    }
}

/// One accepted connection: an event loop that answers each stream in place.
pub struct ServerConnection {
    link: LinkHandle,
    remote: Option<SocketAddr>,
}

impl ServerConnection {
    /// Wrap an arbitrary link, independent of any listening endpoint. Used by
    /// tests to drive the echo loop over an in-process pair.
    pub fn over_link(link: LinkHandle) -> Self {
        Self { link, remote: None }
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Process events until the connection closes. Each received message is
    /// transformed and written back on the stream it arrived on; a failed
    /// write abandons that stream only, never the connection.
    pub async fn run(&self, transform: &dyn MessageTransform) -> Result<(), ServerError> {
        loop {
            match self.link.next_event().await {
                Ok(LinkEvent::StreamData { stream, payload }) => {
                    debug!(
                        target: "ricochet::server",
                        stream,
                        len = payload.len(),
                        "message received"
                    );
                    let response = transform.apply(&payload);
                    match self.link.send(stream, &response).await {
                        Ok(()) => {
                            debug!(
                                target: "ricochet::server",
                                stream,
                                len = response.len(),
                                "response written"
                            );
                        }
                        Err(err) => {
                            warn!(
                                target: "ricochet::server",
                                stream,
                                error = %err,
                                "response write failed"
                            );
                        }
                    }
                }
                Ok(LinkEvent::HandshakeConfirmed) => {
                    debug!(target: "ricochet::server", "transport handshake confirmed");
                }
                Ok(LinkEvent::Closed { reason }) => {
                    info!(target: "ricochet::server", %reason, "connection closed");
                    return Ok(());
                }
                Err(_) => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rico_core::memory_link_pair;

    #[test]
    fn echo_transform_wraps_text_payloads() {
        let transform = EchoTransform::default();
        let response = transform.apply(b"ping");
        let text = String::from_utf8(response).expect("utf-8 response");
        assert_eq!(text, "server received: ping");
        assert!(text.contains("ping"));
    }

    #[test]
    fn echo_transform_echoes_undecodable_payloads_raw() {
        let transform = EchoTransform::default();
        let payload = [0xff, 0xfe, 0x00, 0x42];
        assert_eq!(transform.apply(&payload), payload.to_vec());
    }

    #[test]
    fn closures_are_transforms() {
        let transform = |payload: &[u8]| payload.iter().rev().copied().collect::<Vec<u8>>();
        assert_eq!(transform.apply(b"abc"), b"cba".to_vec());
    }

    #[tokio::test]
    async fn replies_on_the_stream_the_message_arrived_on() {
        let (client_link, server_link) = memory_link_pair(8);
        let connection = ServerConnection::over_link(server_link);
        let loop_task = tokio::spawn(async move {
            connection.run(&EchoTransform::default()).await
        });

        let stream = client_link.open_stream().await.unwrap();
        client_link.send(stream, b"ping").await.unwrap();

        let event = client_link.next_event().await.unwrap();
        match event {
            LinkEvent::StreamData {
                stream: reply_stream,
                payload,
            } => {
                assert_eq!(reply_stream, stream);
                assert_eq!(&payload[..], b"server received: ping");
            }
            other => panic!("expected stream data, got {other:?}"),
        }

        drop(client_link);
        let outcome = loop_task.await.expect("loop task");
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn independent_streams_get_independent_replies() {
        let (client_link, server_link) = memory_link_pair(8);
        let connection = ServerConnection::over_link(server_link);
        tokio::spawn(async move { connection.run(&EchoTransform::default()).await });

        let first = client_link.open_stream().await.unwrap();
        let second = client_link.open_stream().await.unwrap();
        client_link.send(first, b"one").await.unwrap();
        client_link.send(second, b"two").await.unwrap();

        let mut replies = std::collections::HashMap::new();
        for _ in 0..2 {
            if let Ok(LinkEvent::StreamData { stream, payload }) = client_link.next_event().await {
                replies.insert(stream, payload);
            }
        }
        assert_eq!(&replies[&first][..], b"server received: one");
        assert_eq!(&replies[&second][..], b"server received: two");
    }
}
