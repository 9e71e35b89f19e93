//! End-to-end round trips over real loopback QUIC.

use rico_client::{run_message_sequence, Client, ClientConfig, MessageOutcome};
use rico_core::PeerVerification;
use rico_server::{EchoTransform, Server, ServerConfig};
use std::net::SocketAddr;
use std::time::Duration;

fn loopback_config() -> ServerConfig {
    ServerConfig::default().with_listen(SocketAddr::from(([127, 0, 0, 1], 0)))
}

#[tokio::test]
async fn three_messages_come_back_in_order() {
    let server = Server::bind(loopback_config()).expect("bind server");
    let server_addr = server.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.serve(EchoTransform::default()).await;
    });

    let client = Client::new(
        ClientConfig::new(server_addr).with_response_timeout(Duration::from_secs(5)),
    );
    let session = client.connect().await.expect("connect");

    let messages: Vec<String> = ["A", "B", "C"].iter().map(|m| m.to_string()).collect();
    let reports = run_message_sequence(&session, &messages, Duration::ZERO).await;

    assert_eq!(reports.len(), 3);
    for (report, sent) in reports.iter().zip(&messages) {
        assert_eq!(&report.message, sent);
        match &report.outcome {
            MessageOutcome::Answered { response } => {
                assert_eq!(response, &format!("server received: {sent}"));
            }
            other => panic!("expected answer for {sent}, got {other:?}"),
        }
    }
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn pinned_certificate_passes_full_verification() {
    let server = Server::bind(loopback_config().with_hostname("localhost")).expect("bind server");
    let trusted = server.identity().certificate_der();
    let server_addr = server.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.serve(EchoTransform::default()).await;
    });

    // With the generated certificate pinned as the only root, the handshake
    // itself checks the self-signature and the hostname binding.
    let client = Client::new(
        ClientConfig::new(server_addr)
            .with_server_name("localhost")
            .with_verification(PeerVerification::PinnedCertificate(trusted)),
    );
    let session = client.connect().await.expect("verified connect");

    let response = session.send_text("ping").await.expect("echo response");
    assert!(response.contains("ping"));
}

#[tokio::test]
async fn pinned_certificate_rejects_wrong_hostname() {
    let server = Server::bind(loopback_config().with_hostname("localhost")).expect("bind server");
    let trusted = server.identity().certificate_der();
    let server_addr = server.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.serve(EchoTransform::default()).await;
    });

    let client = Client::new(
        ClientConfig::new(server_addr)
            .with_server_name("somewhere.else")
            .with_verification(PeerVerification::PinnedCertificate(trusted)),
    );
    assert!(client.connect().await.is_err());
}

#[tokio::test]
async fn binary_payload_round_trips_unchanged() {
    let server = Server::bind(loopback_config()).expect("bind server");
    let server_addr = server.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = server.serve(EchoTransform::default()).await;
    });

    let session = Client::new(ClientConfig::new(server_addr))
        .connect()
        .await
        .expect("connect");

    // Not valid UTF-8: the server logs and echoes it back untouched.
    let payload = [0xff, 0xfe, 0x00, 0x42];
    let response = session.send(&payload).await.expect("raw echo");
    assert_eq!(&response[..], &payload[..]);
}
