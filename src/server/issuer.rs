//! Issuance service
//!
//! Authorizes a request against the ACL, mints a batch of secrets (plus an optional AEAD
//! key), persists the batch and registers the grant, revoking any earlier grant for the
//! same client, topic and direction.

use crate::aead::{AeadError, AeadKey};
use crate::auth::{
    identity_from_chain, stamp_of, AccessControlList, AccessType, Grant, IdentityError,
    IssueClock, Secret, SECRET_LEN,
};
use crate::registry::{RegistryError, SharedRegistry};
use crate::storage::{SecretStore, StorageError};
use crate::wire::{write_all_timeout, IssuerRequest, IssuerResponse, WireError};
use rand::rngs::OsRng;
use rand::TryRngCore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("batch multiplier {0} out of range [1, 31]")]
    InvalidBatch(u8),

    #[error("{client} may not {access} on {topic}")]
    Unauthorized {
        client: String,
        topic: String,
        access: AccessType,
    },

    #[error("crypto failure: {0}")]
    Crypto(#[from] AeadError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("registry invariant violated: {0}")]
    Fatal(RegistryError),

    #[error("grant arrived out of order: {0}")]
    OutOfOrder(RegistryError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<RegistryError> for IssueError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::OutOfOrder { .. } => IssueError::OutOfOrder(e),
            RegistryError::Inconsistent(_) => IssueError::Fatal(e),
        }
    }
}

pub struct IssuanceService {
    registry: SharedRegistry,
    acl: Arc<AccessControlList>,
    store: Arc<dyn SecretStore>,
    clock: IssueClock,
    /// Held from taking a timestamp until the grant is appended, so grants reach the
    /// registry in timestamp order
    sequence: tokio::sync::Mutex<()>,
}

impl IssuanceService {
    pub fn new(
        registry: SharedRegistry,
        acl: Arc<AccessControlList>,
        store: Arc<dyn SecretStore>,
    ) -> Self {
        Self {
            registry,
            acl,
            store,
            clock: IssueClock::new(),
            sequence: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Mint and register a batch for `client`. Nothing is registered or left on disk
    /// unless this returns `Ok`.
    pub async fn issue(
        &self,
        client: &str,
        request: &IssuerRequest,
    ) -> Result<IssuerResponse, IssueError> {
        if !request.has_valid_batch() {
            return Err(IssueError::InvalidBatch(request.batch_multiplier));
        }

        let permitted = self
            .acl
            .lookup(client.as_bytes(), &request.topic)
            .is_some_and(|mask| mask.allows(request.access));
        if !permitted {
            return Err(IssueError::Unauthorized {
                client: client.to_string(),
                topic: String::from_utf8_lossy(&request.topic).into_owned(),
                access: request.access,
            });
        }

        let key = if request.aead.is_enabled() {
            Some(AeadKey::generate(request.aead)?)
        } else {
            None
        };
        let count = request.batch_size();
        let secrets = random_secrets(count as usize)?;

        let _sequence = self.sequence.lock().await;
        let issued_at = self.clock.next();

        let store = self.store.clone();
        let batch = secrets.clone();
        let source = tokio::task::spawn_blocking(move || store.persist(issued_at, &batch))
            .await
            .map_err(|e| IssueError::Task(e.to_string()))??;

        let grant = Grant::new(
            client.as_bytes().to_vec(),
            request.topic.clone(),
            request.access,
            issued_at,
            count,
            secrets[0],
            source.clone(),
            key.clone(),
        );

        let (revoked, appended) = {
            let mut registry = self.registry.lock();
            let revoked = registry.revoke_matching(client.as_bytes(), &request.topic, request.access);
            (revoked, registry.append(grant))
        };
        if let Some(old) = revoked {
            debug!(client, issued_at = old.issued_at, "Revoked previous grant");
            old.secrets.discard();
        }
        if let Err(e) = appended {
            source.discard();
            return Err(e.into());
        }

        Ok(IssuerResponse {
            key,
            timestamp: stamp_of(issued_at),
            secrets,
        })
    }

    /// Serve one issuer connection: authenticate the peer, read one request, answer it.
    ///
    /// Authorization failures close the connection without a response.
    pub async fn handle_connection<S>(
        &self,
        stream: &mut S,
        client: &str,
        peer: SocketAddr,
        timeout: Duration,
    ) -> Result<(), IssueConnError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let request = IssuerRequest::read_from(stream, timeout).await?;
        debug!(
            peer = %peer,
            client,
            topic = %String::from_utf8_lossy(&request.topic),
            access = %request.access,
            batch = request.batch_size(),
            aead = %request.aead,
            "Issuer request"
        );

        let response = self.issue(client, &request).await?;
        write_all_timeout(stream, &response.encode(), timeout).await?;
        info!(
            peer = %peer,
            client,
            topic = %String::from_utf8_lossy(&request.topic),
            access = %request.access,
            count = response.secrets.len(),
            "Issued token batch"
        );
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum IssueConnError {
    #[error("TLS handshake failed: {0}")]
    Handshake(std::io::Error),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Issue(#[from] IssueError),
}

/// Accept loop for the mTLS issuer listener
pub async fn run_issuer(
    listener: tokio::net::TcpListener,
    acceptor: TlsAcceptor,
    service: Arc<IssuanceService>,
    timeout: Duration,
    fatal: Arc<Notify>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Issuer listening");
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Failed to accept issuer connection");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let service = service.clone();
        let fatal = fatal.clone();

        tokio::spawn(async move {
            match serve_tls(tcp, peer, acceptor, &service, timeout).await {
                Ok(()) => {}
                Err(IssueConnError::Issue(IssueError::Fatal(e))) => {
                    error!(peer = %peer, error = %e, "Token registry corrupted");
                    fatal.notify_one();
                }
                Err(IssueConnError::Issue(e @ IssueError::Unauthorized { .. })) => {
                    warn!(peer = %peer, error = %e, "Issuance denied");
                }
                Err(e) => warn!(peer = %peer, error = %e, "Issuer session error"),
            }
        });
    }
}

async fn serve_tls(
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    service: &IssuanceService,
    timeout: Duration,
) -> Result<(), IssueConnError> {
    let accept = acceptor.accept(tcp);
    let mut tls = if timeout.is_zero() {
        accept.await.map_err(IssueConnError::Handshake)?
    } else {
        tokio::time::timeout(timeout, accept)
            .await
            .map_err(|_| IssueConnError::Wire(WireError::Timeout(timeout)))?
            .map_err(IssueConnError::Handshake)?
    };

    let client = identity_from_chain(tls.get_ref().1.peer_certificates())?;
    service.handle_connection(&mut tls, &client, peer, timeout).await
}

fn random_secrets(count: usize) -> Result<Vec<Secret>, IssueError> {
    let mut bytes = vec![0u8; count * SECRET_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| IssueError::Crypto(AeadError::Random(e.to_string())))?;
    Ok(bytes
        .chunks_exact(SECRET_LEN)
        .filter_map(Secret::from_slice)
        .collect())
}
