//! QUIC-backed [`StreamLink`] adapter.
//!
//! The transport itself (handshake, encryption, congestion control, framing)
//! is delegated to `quinn`; this module only maps its connections onto the
//! narrow stream/event boundary the correlation layer consumes. Each opened or
//! accepted bidirectional stream carries exactly one message per direction: a
//! writer finishes the stream after its single write, and a reader task turns
//! the peer's complete write into one [`LinkEvent::StreamData`].

use crate::event::{CloseReason, LinkEvent, StreamId};
use crate::link::{LinkError, StreamLink, MESSAGE_MAX};
use async_trait::async_trait;
use bytes::Bytes;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

const EVENT_QUEUE_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum QuicSetupError {
    #[error("failed to bind UDP endpoint on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("connection to {remote} failed: {reason}")]
    Connect { remote: SocketAddr, reason: String },
    #[error("invalid TLS configuration: {0}")]
    Tls(String),
    #[error("invalid transport configuration: {0}")]
    Config(String),
}

/// How the client judges the server's certificate.
#[derive(Debug, Clone)]
pub enum PeerVerification {
    /// Trust exactly the given certificate as the only root. The handshake
    /// then proves the certificate's self-signature and name binding.
    PinnedCertificate(CertificateDer<'static>),
    /// Accept any server certificate without verification. This mirrors the
    /// reference demo's insecure default and must not be used outside local
    /// experiments.
    SkipDangerous,
}

/// Client-side connection parameters.
#[derive(Debug, Clone)]
pub struct QuicConnectConfig {
    pub remote: SocketAddr,
    pub server_name: String,
    pub alpn_protocols: Vec<String>,
    pub verification: PeerVerification,
    pub idle_timeout: Duration,
    pub keep_alive_interval: Option<Duration>,
}

impl QuicConnectConfig {
    pub fn new(remote: SocketAddr, server_name: impl Into<String>) -> Self {
        Self {
            remote,
            server_name: server_name.into(),
            alpn_protocols: vec!["http/1.1".to_string()],
            verification: PeerVerification::SkipDangerous,
            idle_timeout: Duration::from_secs(30),
            keep_alive_interval: Some(Duration::from_secs(10)),
        }
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

/// Which side of the connection this link represents. The server side also
/// accepts peer-initiated streams and surfaces them through the event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Client,
    Server,
}

/// [`StreamLink`] over one `quinn::Connection`.
pub struct QuicLink {
    connection: quinn::Connection,
    outbound: Mutex<HashMap<StreamId, quinn::SendStream>>,
    next_stream: AtomicU64,
    events: Mutex<mpsc::Receiver<LinkEvent>>,
    events_tx: mpsc::Sender<LinkEvent>,
    // Keeps the socket driver alive for client links that own their endpoint.
    _endpoint: Option<quinn::Endpoint>,
}

impl QuicLink {
    pub fn new(connection: quinn::Connection, role: LinkRole) -> Arc<Self> {
        Self::with_endpoint(connection, role, None)
    }

    fn with_endpoint(
        connection: quinn::Connection,
        role: LinkRole,
        endpoint: Option<quinn::Endpoint>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let first_stream = match role {
            LinkRole::Client => 0,
            LinkRole::Server => 1,
        };
        let link = Arc::new(Self {
            connection: connection.clone(),
            outbound: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(first_stream),
            events: Mutex::new(events_rx),
            events_tx,
            _endpoint: endpoint,
        });

        // The connection is only handed over once its handshake completed.
        let _ = link.events_tx.try_send(LinkEvent::HandshakeConfirmed);

        let watcher_tx = link.events_tx.clone();
        let watched = connection.clone();
        tokio::spawn(async move {
            let err = watched.closed().await;
            let _ = watcher_tx
                .send(LinkEvent::Closed {
                    reason: close_reason(err),
                })
                .await;
        });

        if role == LinkRole::Server {
            link.spawn_acceptor();
        }

        link
    }

    /// Peer socket address for logging.
    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Close the connection locally. Pending streams are abandoned.
    pub fn close(&self) {
        self.connection.close(0u32.into(), b"done");
    }

    fn spawn_acceptor(self: &Arc<Self>) {
        let link = Arc::clone(self);
        tokio::spawn(async move {
            // Peer-initiated bidirectional streams arrive in id order, so a
            // local counter in the same spacing labels them consistently.
            let mut next_inbound: StreamId = 0;
            loop {
                match link.connection.accept_bi().await {
                    Ok((send, recv)) => {
                        let stream = next_inbound;
                        next_inbound += 4;
                        link.outbound.lock().await.insert(stream, send);
                        link.spawn_reader(stream, recv);
                    }
                    // The close watcher reports the reason.
                    Err(_) => break,
                }
            }
        });
    }

    fn spawn_reader(&self, stream: StreamId, mut recv: quinn::RecvStream) {
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            match recv.read_to_end(MESSAGE_MAX).await {
                Ok(payload) => {
                    let _ = tx
                        .send(LinkEvent::StreamData {
                            stream,
                            payload: Bytes::from(payload),
                        })
                        .await;
                }
                Err(err) => {
                    debug!(target: "ricochet::link", stream, error = %err, "stream read abandoned");
                }
            }
        });
    }
}

#[async_trait]
impl StreamLink for QuicLink {
    async fn open_stream(&self) -> Result<StreamId, LinkError> {
        let (send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|err| LinkError::Transport(err.to_string()))?;
        let stream = self.next_stream.fetch_add(4, Ordering::Relaxed);
        self.outbound.lock().await.insert(stream, send);
        self.spawn_reader(stream, recv);
        Ok(stream)
    }

    async fn send(&self, stream: StreamId, payload: &[u8]) -> Result<(), LinkError> {
        if payload.len() > MESSAGE_MAX {
            return Err(LinkError::MessageTooLarge {
                size: payload.len(),
                limit: MESSAGE_MAX,
            });
        }
        // One message per stream: sending consumes the write half and
        // finishes the stream behind it.
        let mut half = self
            .outbound
            .lock()
            .await
            .remove(&stream)
            .ok_or(LinkError::UnknownStream(stream))?;
        half.write_all(payload)
            .await
            .map_err(|err| LinkError::Transport(err.to_string()))?;
        half.finish().map_err(|_| LinkError::Closed)?;
        Ok(())
    }

    async fn next_event(&self) -> Result<LinkEvent, LinkError> {
        let mut events = self.events.lock().await;
        events.recv().await.ok_or(LinkError::Closed)
    }
}

fn close_reason(err: quinn::ConnectionError) -> CloseReason {
    match err {
        quinn::ConnectionError::ApplicationClosed(close) => CloseReason::ByPeer(close.to_string()),
        quinn::ConnectionError::ConnectionClosed(close) => CloseReason::ByPeer(close.to_string()),
        quinn::ConnectionError::TimedOut => CloseReason::TimedOut,
        quinn::ConnectionError::LocallyClosed => CloseReason::LocallyClosed,
        other => CloseReason::Transport(other.to_string()),
    }
}

/// Dial `config.remote` and wrap the resulting connection as a client link.
pub async fn connect(config: QuicConnectConfig) -> Result<Arc<QuicLink>, QuicSetupError> {
    let bind_addr: SocketAddr = ([0, 0, 0, 0], 0).into();
    let mut endpoint =
        quinn::Endpoint::client(bind_addr).map_err(|source| QuicSetupError::Bind {
            addr: bind_addr,
            source,
        })?;

    let mut crypto = match &config.verification {
        PeerVerification::PinnedCertificate(cert) => {
            let mut roots = rustls::RootCertStore::empty();
            roots
                .add(cert.clone())
                .map_err(|err| QuicSetupError::Tls(err.to_string()))?;
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        PeerVerification::SkipDangerous => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
            .with_no_client_auth(),
    };
    crypto.alpn_protocols = alpn_bytes(&config.alpn_protocols);

    let quic_crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|err| QuicSetupError::Tls(err.to_string()))?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(quic_crypto));
    client_config.transport_config(transport_config(
        config.idle_timeout,
        config.keep_alive_interval,
    )?);
    endpoint.set_default_client_config(client_config);

    let connecting = endpoint
        .connect(config.remote, &config.server_name)
        .map_err(|err| QuicSetupError::Connect {
            remote: config.remote,
            reason: err.to_string(),
        })?;
    let connection = connecting.await.map_err(|err| QuicSetupError::Connect {
        remote: config.remote,
        reason: err.to_string(),
    })?;

    Ok(QuicLink::with_endpoint(
        connection,
        LinkRole::Client,
        Some(endpoint),
    ))
}

/// Build a listening endpoint serving the given identity.
pub fn server_endpoint(
    listen: SocketAddr,
    certificate: CertificateDer<'static>,
    private_key: PrivateKeyDer<'static>,
    alpn_protocols: &[String],
    idle_timeout: Duration,
) -> Result<quinn::Endpoint, QuicSetupError> {
    let mut crypto = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![certificate], private_key)
        .map_err(|err| QuicSetupError::Tls(err.to_string()))?;
    crypto.alpn_protocols = alpn_bytes(alpn_protocols);

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from(crypto)
        .map_err(|err| QuicSetupError::Tls(err.to_string()))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
    server_config.transport_config(transport_config(idle_timeout, None)?);

    quinn::Endpoint::server(server_config, listen).map_err(|source| QuicSetupError::Bind {
        addr: listen,
        source,
    })
}

fn transport_config(
    idle_timeout: Duration,
    keep_alive_interval: Option<Duration>,
) -> Result<Arc<quinn::TransportConfig>, QuicSetupError> {
    let idle = quinn::IdleTimeout::try_from(idle_timeout)
        .map_err(|_| QuicSetupError::Config("idle timeout out of range".to_string()))?;
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(idle));
    if let Some(interval) = keep_alive_interval {
        transport.keep_alive_interval(Some(interval));
    }
    Ok(Arc::new(transport))
}

fn alpn_bytes(protocols: &[String]) -> Vec<Vec<u8>> {
    protocols
        .iter()
        .map(|proto| proto.as_bytes().to_vec())
        .collect()
}

/// Certificate verifier that accepts anything it is shown.
///
/// Counterpart of the reference client's disabled verification mode; local
/// demos only.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}
