//! Verifier client used by the proxy

use crate::server::TokenVerifier;
use crate::wire::{write_all_timeout, VerifierRequest, VerifierResponse, WireError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Opens one local TCP connection per verification request
#[derive(Debug, Clone)]
pub struct TcpVerifierClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpVerifierClient {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl TokenVerifier for TcpVerifierClient {
    async fn verify(&self, request: &VerifierRequest) -> Result<VerifierResponse, WireError> {
        let connect = TcpStream::connect(self.addr);
        let mut stream = if self.timeout.is_zero() {
            connect.await?
        } else {
            tokio::time::timeout(self.timeout, connect)
                .await
                .map_err(|_| WireError::Timeout(self.timeout))??
        };
        write_all_timeout(&mut stream, &request.encode(), self.timeout).await?;
        VerifierResponse::read_from(&mut stream, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessType, Secret, Token};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_round_trip_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let req = VerifierRequest::read_from(&mut stream, Duration::from_secs(1))
                .await
                .unwrap();
            assert_eq!(req.access, AccessType::Subscribe);
            let resp = VerifierResponse::Success {
                reload_needed: true,
                key: None,
                topic: b"sensors/temp".to_vec(),
            };
            write_all_timeout(&mut stream, &resp.encode().unwrap(), Duration::from_secs(1))
                .await
                .unwrap();
        });

        let client = TcpVerifierClient::new(addr, Duration::from_secs(1));
        let token = Token::new(42, Secret::new([7; 6]));
        let resp = client
            .verify(&VerifierRequest::new(AccessType::Subscribe, token))
            .await
            .unwrap();
        assert_eq!(resp.topic(), Some(&b"sensors/temp"[..]));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_verifier_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TcpVerifierClient::new(addr, Duration::from_millis(500));
        let token = Token::new(1, Secret::new([0; 6]));
        assert!(client
            .verify(&VerifierRequest::new(AccessType::Publish, token))
            .await
            .is_err());
    }
}
