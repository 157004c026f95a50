//! MQTT-MTD CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use clap::Parser;
use mqttmtd::auth::AccessControlList;
use mqttmtd::proxy::{Proxy, ProxyConfig};
use mqttmtd::server::{AuthServer, AuthServerConfig};
use mqttmtd::tls::TlsMaterial;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Authserver {
            issuer_addr,
            verifier_addr,
            ca,
            cert,
            key,
            acl,
            storage,
            tokens_dir,
            external_timeout_ms,
            local_timeout_ms,
            sweep_secs,
            horizon_secs,
        } => {
            let tls = TlsMaterial::load(&ca, &cert, &key).context("Failed to load TLS material")?;
            let acl = AccessControlList::load_file(&acl)
                .with_context(|| format!("Failed to load ACL: {}", acl.display()))?;
            let store = storage
                .build(tokens_dir)
                .context("Failed to prepare secret storage")?;

            let config = AuthServerConfig::new(tls, acl)
                .issuer_addr(issuer_addr)
                .verifier_addr(verifier_addr)
                .store(store)
                .timeouts(
                    Duration::from_millis(external_timeout_ms),
                    Duration::from_millis(local_timeout_ms),
                )
                .sweep_interval(Duration::from_secs(sweep_secs))
                .horizon(Duration::from_secs(horizon_secs));

            until_shutdown("auth server", AuthServer::new(config).run()).await
        }
        Commands::Proxy {
            bind,
            broker,
            verifier,
            timeout_ms,
            verifier_timeout_ms,
            idle_timeout_secs,
            max_frame,
        } => {
            let config = ProxyConfig::new(broker, verifier)
                .bind_addr(bind)
                .timeout(Duration::from_millis(timeout_ms))
                .verifier_timeout(Duration::from_millis(verifier_timeout_ms))
                .idle_timeout(Duration::from_secs(idle_timeout_secs))
                .max_frame(max_frame);

            until_shutdown("proxy", Proxy::new(config).run()).await
        }
        Commands::Acl { path } => {
            let acl = AccessControlList::load_file(&path)
                .with_context(|| format!("Failed to load ACL: {}", path.display()))?;

            let mut clients: Vec<_> = acl.clients().collect();
            clients.sort_by_key(|(name, _)| *name);
            for (client, topics) in clients {
                println!("{}", client);
                let mut topics: Vec<_> = topics.iter().collect();
                topics.sort_by_key(|(topic, _)| *topic);
                for (topic, mask) in topics {
                    println!("  {} {}", mask, topic);
                }
            }
            println!();
            println!("{} entries", acl.len());
            Ok(())
        }
    }
}

async fn until_shutdown<F>(name: &str, service: F) -> Result<()>
where
    F: std::future::Future<Output = Result<()>>,
{
    tokio::select! {
        result = service => result?,
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping {}", name);
        }
    }
    info!("{} stopped", name);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
