//! Talking to the issuer

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use mqttmtd::tls::TlsMaterial;
use mqttmtd::wire::{write_all_timeout, IssuerRequest, IssuerResponse, WireError};
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Source of fresh token batches
#[async_trait]
pub trait IssuerClient: Send + Sync {
    async fn issue(&self, request: &IssuerRequest) -> Result<IssuerResponse>;
}

/// Issuer reached over mutual TLS, one connection per request
pub struct TlsIssuerClient {
    addr: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    timeout: Duration,
}

impl TlsIssuerClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let material = TlsMaterial::load(&config.ca_cert, &config.client_cert, &config.client_key)?;
        Self::from_material(config, &material)
    }

    /// Build from PEM already in memory
    pub fn from_material(config: &ClientConfig, material: &TlsMaterial) -> Result<Self> {
        let server_name = ServerName::try_from(config.server_name.clone())
            .map_err(|e| ClientError::InvalidRequest(format!("server name: {e}")))?;
        Ok(Self {
            addr: config.issuer_addr.clone(),
            server_name,
            connector: TlsConnector::from(material.client_config()?),
            timeout: config.timeout,
        })
    }

    async fn connect(&self) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let handshake = async {
            let tcp = TcpStream::connect(&self.addr)
                .await
                .map_err(|e| ClientError::Connection(format!("{}: {e}", self.addr)))?;
            self.connector
                .connect(self.server_name.clone(), tcp)
                .await
                .map_err(|e| ClientError::Connection(format!("TLS handshake with {}: {e}", self.addr)))
        };
        if self.timeout.is_zero() {
            handshake.await
        } else {
            tokio::time::timeout(self.timeout, handshake)
                .await
                .map_err(|_| ClientError::Protocol(WireError::Timeout(self.timeout)))?
        }
    }
}

#[async_trait]
impl IssuerClient for TlsIssuerClient {
    async fn issue(&self, request: &IssuerRequest) -> Result<IssuerResponse> {
        let mut stream = self.connect().await?;
        debug!(issuer = %self.addr, "Opened issuer connection");

        write_all_timeout(&mut stream, &request.encode()?, self.timeout).await?;
        match IssuerResponse::read_from(&mut stream, request, self.timeout).await {
            Ok(response) => Ok(response),
            Err(WireError::Closed) => Err(ClientError::Denied),
            Err(e) => Err(e.into()),
        }
    }
}
