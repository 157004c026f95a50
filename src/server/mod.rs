//! Auth server
//!
//! Runs three tasks over one shared [`TokenRegistry`](crate::registry::TokenRegistry):
//! - the issuer, an mTLS listener minting token batches for authenticated clients
//! - the verifier, a local plain-TCP listener consuming tokens for the proxy
//! - the sweeper, evicting expired grants on a fixed interval

pub mod issuer;
pub mod sweeper;
pub mod verifier;

pub use issuer::{run_issuer, IssuanceService, IssueConnError, IssueError};
pub use sweeper::{run_sweeper, sweep};
pub use verifier::{run_verifier, TokenVerifier, VerificationService};

use crate::auth::AccessControlList;
use crate::registry::{SharedRegistry, TokenRegistry, DEFAULT_HORIZON};
use crate::storage::{MemoryStore, SecretStore};
use crate::tls::TlsMaterial;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::info;

pub const DEFAULT_ISSUER_ADDR: &str = "0.0.0.0:18883";
pub const DEFAULT_VERIFIER_ADDR: &str = "127.0.0.1:18884";

/// Auth server configuration
#[derive(Clone)]
pub struct AuthServerConfig {
    pub issuer_addr: SocketAddr,
    pub verifier_addr: SocketAddr,
    pub tls: TlsMaterial,
    pub acl: Arc<AccessControlList>,
    pub store: Arc<dyn SecretStore>,
    /// Per read/write deadline on issuer (client-facing) connections
    pub external_timeout: Duration,
    /// Per read/write deadline on verifier (proxy-facing) connections
    pub local_timeout: Duration,
    pub sweep_interval: Duration,
    pub horizon: Duration,
}

impl AuthServerConfig {
    pub fn new(tls: TlsMaterial, acl: AccessControlList) -> Self {
        Self {
            issuer_addr: SocketAddr::from(([0, 0, 0, 0], 18883)),
            verifier_addr: SocketAddr::from(([127, 0, 0, 1], 18884)),
            tls,
            acl: Arc::new(acl),
            store: Arc::new(MemoryStore),
            external_timeout: Duration::from_secs(5),
            local_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
            horizon: DEFAULT_HORIZON,
        }
    }

    pub fn issuer_addr(mut self, addr: SocketAddr) -> Self {
        self.issuer_addr = addr;
        self
    }

    pub fn verifier_addr(mut self, addr: SocketAddr) -> Self {
        self.verifier_addr = addr;
        self
    }

    pub fn store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.store = store;
        self
    }

    pub fn timeouts(mut self, external: Duration, local: Duration) -> Self {
        self.external_timeout = external;
        self.local_timeout = local;
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn horizon(mut self, horizon: Duration) -> Self {
        self.horizon = horizon;
        self
    }
}

pub struct AuthServer {
    config: AuthServerConfig,
    registry: SharedRegistry,
}

impl AuthServer {
    pub fn new(config: AuthServerConfig) -> Self {
        let registry = TokenRegistry::shared(config.horizon);
        Self { config, registry }
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    /// Bind both listeners and serve until a task fails
    pub async fn run(self) -> Result<()> {
        let issuer = TcpListener::bind(self.config.issuer_addr)
            .await
            .with_context(|| format!("Failed to bind issuer on {}", self.config.issuer_addr))?;
        let verifier = TcpListener::bind(self.config.verifier_addr)
            .await
            .with_context(|| format!("Failed to bind verifier on {}", self.config.verifier_addr))?;
        self.serve(issuer, verifier).await
    }

    /// Serve on already-bound listeners
    pub async fn serve(self, issuer: TcpListener, verifier: TcpListener) -> Result<()> {
        let acceptor = TlsAcceptor::from(
            self.config
                .tls
                .server_config()
                .context("Failed to build issuer TLS config")?,
        );
        let fatal = Arc::new(Notify::new());
        let issuance = Arc::new(IssuanceService::new(
            self.registry.clone(),
            self.config.acl.clone(),
            self.config.store.clone(),
        ));
        let verification = VerificationService::new(self.registry.clone());

        info!(
            storage = self.config.store.name(),
            acl_entries = self.config.acl.len(),
            horizon_secs = self.config.horizon.as_secs(),
            "Auth server starting"
        );

        tokio::select! {
            result = run_issuer(issuer, acceptor, issuance, self.config.external_timeout, fatal.clone()) => result,
            result = run_verifier(verifier, verification, self.config.local_timeout) => result,
            _ = run_sweeper(self.registry.clone(), self.config.sweep_interval) => Ok(()),
            _ = fatal.notified() => Err(anyhow::anyhow!("Token registry invariant violated")),
        }
    }
}
