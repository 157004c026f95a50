//! MQTT interface
//!
//! Accepts MQTT clients, dials the broker for each one and relays frames both ways, trading
//! tokens for real topics through the verifier on the way in.

pub mod packet;
pub mod session;
pub mod verifier_client;

pub use session::{Session, SessionSettings};
pub use verifier_client::TcpVerifierClient;

use crate::aead::AeadError;
use crate::auth::{AccessType, TokenError};
use crate::server::TokenVerifier;
use crate::wire::mqtt::PacketType;
use crate::wire::{ResultCode, WireError};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const DEFAULT_PROXY_ADDR: &str = "0.0.0.0:1883";
pub const DEFAULT_MAX_FRAME: usize = 65536;
/// One and a half times a 60s MQTT keepalive
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("verifier unavailable: {0}")]
    Verifier(#[source] WireError),

    #[error("{access} token rejected with code {code:?}")]
    Rejected { access: AccessType, code: ResultCode },

    #[error("topic is not a valid token: {0}")]
    Token(#[from] TokenError),

    #[error("payload crypto failed: {0}")]
    Aead(#[from] AeadError),

    #[error("{0} received before CONNECT")]
    NotConnected(PacketType),
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    pub broker_addr: SocketAddr,
    pub verifier_addr: SocketAddr,
    /// Per read/write deadline on client and broker connections
    pub timeout: Duration,
    /// Deadline for each verifier exchange
    pub verifier_timeout: Duration,
    /// Silence allowed between frames before a session is dropped
    pub idle_timeout: Duration,
    pub max_frame: usize,
}

impl ProxyConfig {
    pub fn new(broker_addr: SocketAddr, verifier_addr: SocketAddr) -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 1883)),
            broker_addr,
            verifier_addr,
            timeout: Duration::from_secs(5),
            verifier_timeout: Duration::from_secs(1),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn verifier_timeout(mut self, timeout: Duration) -> Self {
        self.verifier_timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn max_frame(mut self, max: usize) -> Self {
        self.max_frame = max;
        self
    }
}

pub struct Proxy {
    config: ProxyConfig,
    verifier: Arc<dyn TokenVerifier>,
}

impl Proxy {
    pub fn new(config: ProxyConfig) -> Self {
        let verifier = Arc::new(TcpVerifierClient::new(
            config.verifier_addr,
            config.verifier_timeout,
        ));
        Self { config, verifier }
    }

    /// Use a different verifier, e.g. an in-process service
    pub fn with_verifier(config: ProxyConfig, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { config, verifier }
    }

    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind proxy on {}", self.config.bind_addr))?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!(
            addr = %listener.local_addr()?,
            broker = %self.config.broker_addr,
            verifier = %self.config.verifier_addr,
            "Proxy listening"
        );
        let settings = SessionSettings {
            timeout: self.config.timeout,
            idle_timeout: self.config.idle_timeout,
            max_frame: self.config.max_frame,
        };

        loop {
            let (client, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "Failed to accept client connection");
                    continue;
                }
            };
            let span = info_span!("session", id = %Uuid::new_v4(), peer = %peer);
            let session = Session::new(self.verifier.clone(), settings);
            let broker_addr = self.config.broker_addr;
            let timeout = self.config.timeout;

            tokio::spawn(
                async move {
                    let broker = match dial(broker_addr, timeout).await {
                        Ok(broker) => broker,
                        Err(e) => {
                            warn!(broker = %broker_addr, error = %e, "Failed to reach broker");
                            return;
                        }
                    };
                    debug!("Session opened");
                    match session.relay(client, broker).await {
                        Ok(()) => debug!("Session closed"),
                        Err(e) => warn!(error = %e, "Session aborted"),
                    }
                }
                .instrument(span),
            );
        }
    }
}

async fn dial(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, WireError> {
    let connect = TcpStream::connect(addr);
    let stream = if timeout.is_zero() {
        connect.await?
    } else {
        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| WireError::Timeout(timeout))??
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProxyConfig {
        ProxyConfig::new(
            "127.0.0.1:1884".parse().unwrap(),
            "127.0.0.1:18884".parse().unwrap(),
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = config();
        assert_eq!(config.bind_addr.to_string(), DEFAULT_PROXY_ADDR);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.verifier_timeout, Duration::from_secs(1));
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.max_frame, 65536);
    }

    #[test]
    fn test_config_builder_chain() {
        let config = config()
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .timeout(Duration::from_millis(250))
            .verifier_timeout(Duration::from_millis(50))
            .idle_timeout(Duration::from_secs(30))
            .max_frame(1024);
        assert_eq!(config.bind_addr.port(), 0);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.verifier_timeout, Duration::from_millis(50));
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.max_frame, 1024);
    }

    #[test]
    fn test_error_messages() {
        let err = ProxyError::NotConnected(PacketType::Subscribe);
        assert_eq!(err.to_string(), "SUBSCRIBE received before CONNECT");
        let err = ProxyError::Rejected {
            access: AccessType::Publish,
            code: ResultCode::Fail,
        };
        assert!(err.to_string().contains("rejected"));
    }
}
