use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use rico_client::{run_message_sequence, Client, ClientConfig};
use rico_server::{EchoTransform, Server, ServerConfig};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "ricochet",
    author,
    version,
    about = "Echo demo over multiplexed encrypted transport streams",
    propagate_version = true
)]
struct Cli {
    /// Increase output verbosity (-v, -vv).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the echo server with a freshly generated identity.
    Serve(ServeArgs),
    /// Connect to a server and send a sequence of messages.
    Send(SendArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// UDP socket to listen on.
    #[arg(short = 'l', long, default_value = "0.0.0.0:4433")]
    listen: SocketAddr,

    /// Hostname the generated certificate is bound to.
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Identity validity window in days.
    #[arg(long, default_value_t = 10)]
    validity_days: u32,

    /// Supported ALPN protocols (comma separated or repeat the flag).
    #[arg(long, value_delimiter = ',', default_values_t = vec!["http/1.1".to_string()])]
    alpn: Vec<String>,

    /// Maximum connections handled in parallel.
    #[arg(long, default_value_t = 256)]
    max_connections: usize,

    /// Prefix wrapped around each echoed message.
    #[arg(long, default_value = "server received: ")]
    prefix: String,

    /// Where to persist the generated certificate.
    #[arg(long, default_value = "server_cert.pem")]
    cert_out: PathBuf,

    /// Where to persist the generated private key.
    #[arg(long, default_value = "server_key.pem")]
    key_out: PathBuf,

    /// Keep the identity in memory only; skip writing the PEM files.
    #[arg(long)]
    ephemeral: bool,
}

#[derive(Args, Debug)]
struct SendArgs {
    /// Server address to connect to.
    #[arg(short = 's', long, default_value = "127.0.0.1:4433")]
    server: SocketAddr,

    /// TLS server name presented during the handshake.
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// Supported ALPN protocols.
    #[arg(long, value_delimiter = ',', default_values_t = vec!["http/1.1".to_string()])]
    alpn: Vec<String>,

    /// Seconds to wait for each response.
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,

    /// Pause between messages, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pacing_ms: u64,

    /// Messages to send, in order.
    #[arg(default_values_t = vec![
        "hello over ricochet".to_string(),
        "second test message".to_string(),
        "all done, goodbye".to_string(),
    ])]
    messages: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Send(args) => run_send(args).await,
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = ServerConfig::default()
        .with_listen(args.listen)
        .with_hostname(&args.hostname)
        .with_validity_days(args.validity_days)
        .with_alpn_protocols(args.alpn.iter().cloned())
        .with_max_connections(args.max_connections);
    let server = Server::bind(config).context("failed to start server")?;

    if !args.ephemeral {
        server
            .identity()
            .persist(&args.cert_out, &args.key_out)
            .context("failed to persist identity")?;
        info!(
            certificate = %args.cert_out.display(),
            private_key = %args.key_out.display(),
            "identity persisted"
        );
    }

    tokio::select! {
        result = server.serve(EchoTransform::new(args.prefix)) => {
            result.context("server terminated")?;
        }
        _ = signal::ctrl_c() => {
            info!("interrupt received; server stopped");
        }
    }
    Ok(())
}

async fn run_send(args: SendArgs) -> Result<()> {
    let config = ClientConfig::new(args.server)
        .with_server_name(&args.server_name)
        .with_alpn_protocols(args.alpn.iter().cloned())
        .with_response_timeout(Duration::from_secs(args.timeout_secs));
    let client = Client::new(config);
    let session = client.connect().await.context("failed to connect")?;

    let pacing = Duration::from_millis(args.pacing_ms);
    let reports = tokio::select! {
        reports = run_message_sequence(&session, &args.messages, pacing) => reports,
        _ = signal::ctrl_c() => {
            info!("interrupt received; sequence aborted");
            return Ok(());
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&reports).context("failed to render report")?
    );
    Ok(())
}
