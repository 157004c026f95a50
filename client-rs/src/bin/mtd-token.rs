//! Print the next token for a topic, fetching a batch from the issuer when needed

use anyhow::{Context, Result};
use clap::Parser;
use mqttmtd::aead::AeadType;
use mqttmtd::auth::AccessType;
use mqttmtd_client::{ClientConfig, FetchRequest, TlsIssuerClient, TokenStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "mtd-token")]
#[command(about = "Fetch the next MQTT-MTD token for a topic")]
#[command(version)]
struct Args {
    /// Topic the token stands in for
    #[arg(short, long)]
    topic: String,

    /// Direction: PUB or SUB
    #[arg(short, long, value_parser = parse_access)]
    access: AccessType,

    /// Tokens per batch (multiple of 16, up to 496)
    #[arg(short = 'n', long, default_value_t = 16)]
    batch: u16,

    /// Payload AEAD: none, aes-128-gcm, aes-256-gcm or chacha20-poly1305
    #[arg(long, default_value = "none", value_parser = parse_aead)]
    aead: AeadType,

    /// Print base64url instead of upper-case hex
    #[arg(long)]
    b64: bool,

    /// Print only the token
    #[arg(long)]
    token_only: bool,

    /// Issuer address
    #[arg(long, env = "MQTTMTD_ISSUER", default_value = "server.local:18883")]
    issuer: String,

    /// Name on the issuer certificate
    #[arg(long, env = "MQTTMTD_SERVER_NAME", default_value = "server.local")]
    server_name: String,

    /// CA certificate (PEM)
    #[arg(long, env = "MQTTMTD_CA_CERT", default_value = "/mqttmtd/certs/ca/ca.crt")]
    ca: PathBuf,

    /// Client certificate (PEM)
    #[arg(long, env = "MQTTMTD_CLIENT_CERT", default_value = "/mqttmtd/certs/client/client.crt")]
    cert: PathBuf,

    /// Client private key (PEM)
    #[arg(long, env = "MQTTMTD_CLIENT_KEY", default_value = "/mqttmtd/certs/client/client.key")]
    key: PathBuf,

    /// Token record directory
    #[arg(long, env = "MQTTMTD_TOKENS_DIR", default_value = "/mqttmtd/tokens")]
    tokens_dir: PathBuf,

    /// Socket timeout in milliseconds (0 = none)
    #[arg(long, env = "MQTTMTD_TIMEOUT_MS", default_value_t = 5000)]
    timeout_ms: u64,

    /// Log level
    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    log_level: String,
}

fn parse_access(s: &str) -> Result<AccessType, String> {
    AccessType::parse(s).ok_or_else(|| format!("Invalid access type: {}. Must be PUB or SUB", s))
}

fn parse_aead(s: &str) -> Result<AeadType, String> {
    AeadType::parse(s).ok_or_else(|| format!("Unknown AEAD type: {}", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ClientConfig::new(args.issuer)
        .server_name(args.server_name)
        .certs(args.ca, args.cert, args.key)
        .tokens_dir(args.tokens_dir)
        .timeout(Duration::from_millis(args.timeout_ms));

    let issuer = Arc::new(TlsIssuerClient::new(&config).context("Failed to set up issuer client")?);
    let store = TokenStore::new(&config.tokens_dir, issuer)?;
    let request = FetchRequest::new(args.access, args.batch).aead(args.aead);
    let issued = store
        .fetch(&args.topic, &request)
        .await
        .with_context(|| format!("Failed to get a token for {}", args.topic))?;

    let token = if args.b64 {
        issued.token.to_base64()
    } else {
        hex::encode_upper(issued.token.to_bytes())
    };

    if args.token_only {
        println!("{}", token);
        return Ok(());
    }

    println!("Token: {}", token);
    if let Some(key) = issued.key {
        println!("Index: {}", key.index);
        println!("Key ({}): {}", key.key.kind, hex::encode_upper(key.key.as_bytes()));
    }
    Ok(())
}
