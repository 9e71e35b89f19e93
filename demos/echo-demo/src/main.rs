use anyhow::{ensure, Result};
use rico_client::{run_message_sequence, Client, ClientConfig, MessageOutcome};
use rico_core::PeerVerification;
use rico_server::{EchoTransform, Server, ServerConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .compact()
        .init();

    info!("starting ricochet echo demo");

    let server = Server::bind(
        ServerConfig::default()
            .with_listen(SocketAddr::from(([127, 0, 0, 1], 0)))
            .with_hostname("localhost"),
    )?;
    let server_addr = server.local_addr()?;
    let trusted = server.identity().certificate_der();
    info!(?server_addr, "server socket bound");

    tokio::spawn(async move {
        let _ = server.serve(EchoTransform::default()).await;
    });

    // Pin the server's own certificate so the demo also exercises real
    // verification instead of the insecure skip mode.
    let client = Client::new(
        ClientConfig::new(server_addr)
            .with_server_name("localhost")
            .with_verification(PeerVerification::PinnedCertificate(trusted))
            .with_response_timeout(Duration::from_secs(5)),
    );
    let session = client.connect().await?;

    let messages: Vec<String> = ["A", "B", "C"].iter().map(|m| m.to_string()).collect();
    let reports =
        run_message_sequence(&session, &messages, Duration::from_millis(250)).await;

    for report in &reports {
        ensure!(
            matches!(&report.outcome, MessageOutcome::Answered { response }
                if response.contains(&report.message)),
            "message {:?} did not round-trip",
            report.message
        );
    }
    info!(summary = %serde_json::to_string(&reports)?, "all messages answered");

    info!("demo finished");
    Ok(())
}
