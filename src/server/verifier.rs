//! Verification service
//!
//! Looks a presented token up in the registry, consumes it and answers with the real topic
//! (and the batch key, if any). Each token verifies at most once.

use crate::auth::{now_nanos, Grant, Secret};
use crate::registry::{GrantId, SharedRegistry};
use crate::storage::SecretSource;
use crate::wire::{write_all_timeout, VerifiedKey, VerifierRequest, VerifierResponse, WireError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Anything that can answer verification requests
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, request: &VerifierRequest) -> Result<VerifierResponse, WireError>;
}

enum Advance {
    /// Next secret already installed
    Ready,
    /// Batch used up; grant removed
    Exhausted(Option<Grant>),
    /// Next secret must be read from disk before the grant is usable again
    Fetch {
        id: GrantId,
        index: u16,
        source: Arc<dyn SecretSource>,
    },
}

#[derive(Clone)]
pub struct VerificationService {
    registry: SharedRegistry,
}

impl VerificationService {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    pub async fn verify_token(&self, request: &VerifierRequest) -> VerifierResponse {
        let (claimed, evicted) = {
            let mut registry = self.registry.lock();
            let lookup = registry.lookup_by_token(&request.token, now_nanos());
            let claimed = lookup.grant.and_then(|id| claim(&mut registry, id, request));
            (claimed, lookup.evicted)
        };
        for grant in evicted {
            debug!(issued_at = grant.issued_at, "Evicted expired grant");
            grant.secrets.discard();
        }

        let Some((advance, topic, key)) = claimed else {
            debug!(token = %request.token.to_base64(), access = %request.access, "Verification failed");
            return VerifierResponse::Fail;
        };

        let reload_needed = match advance {
            Advance::Ready => false,
            Advance::Exhausted(removed) => {
                if let Some(grant) = removed {
                    grant.secrets.discard();
                }
                true
            }
            Advance::Fetch { id, index, source } => self.install_next(id, index, source).await,
        };

        debug!(
            topic = %String::from_utf8_lossy(&topic),
            access = %request.access,
            reload_needed,
            "Token verified"
        );
        VerifierResponse::Success {
            reload_needed,
            key,
            topic,
        }
    }

    /// Read the next secret outside the lock and put it in place. Returns whether the grant
    /// had to be dropped instead.
    async fn install_next(&self, id: GrantId, index: u16, source: Arc<dyn SecretSource>) -> bool {
        let reader = source.clone();
        let next: Option<Secret> = match tokio::task::spawn_blocking(move || reader.secret_at(index)).await {
            Ok(Ok(secret)) => Some(secret),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to read next secret; dropping grant");
                None
            }
            Err(e) => {
                warn!(error = %e, "Secret read task failed; dropping grant");
                None
            }
        };

        let removed = {
            let mut registry = self.registry.lock();
            match next {
                Some(secret) => {
                    if let Some(grant) = registry.get_mut(id) {
                        if grant.cursor == index {
                            grant.current_secret = Some(secret);
                        }
                    }
                    None
                }
                None => registry.remove(id),
            }
        };
        match removed {
            Some(grant) => {
                grant.secrets.discard();
                true
            }
            None => next.is_none(),
        }
    }

    /// Answer verification requests on one connection until the peer closes it
    pub async fn handle_connection<S>(
        &self,
        stream: &mut S,
        peer: SocketAddr,
        timeout: Duration,
    ) -> Result<(), WireError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let request = match VerifierRequest::read_from(stream, timeout).await {
                Ok(r) => r,
                Err(e) if e.is_closed() => return Ok(()),
                Err(e) => return Err(e),
            };
            let response = self.verify_token(&request).await;
            debug!(peer = %peer, code = ?response.code(), "Verifier response");
            write_all_timeout(stream, &response.encode()?, timeout).await?;
        }
    }
}

/// Consume the current token of grant `id` under the lock
fn claim(
    registry: &mut crate::registry::TokenRegistry,
    id: GrantId,
    request: &VerifierRequest,
) -> Option<(Advance, Vec<u8>, Option<VerifiedKey>)> {
    let grant = registry.get_mut(id)?;
    if grant.access != request.access {
        return None;
    }

    let index = grant.cursor;
    let topic = grant.topic.clone();
    let key = grant.aead.clone().map(|key| VerifiedKey { index, key });

    if index + 1 >= grant.token_count {
        return Some((Advance::Exhausted(registry.remove(id)), topic, key));
    }

    grant.cursor = index + 1;
    let next = grant.cursor;
    if grant.secrets.is_resident() {
        match grant.secrets.secret_at(next) {
            Ok(secret) => {
                grant.current_secret = Some(secret);
                Some((Advance::Ready, topic, key))
            }
            Err(_) => Some((Advance::Exhausted(registry.remove(id)), topic, key)),
        }
    } else {
        grant.current_secret = None;
        let source = grant.secrets.clone();
        Some((
            Advance::Fetch {
                id,
                index: next,
                source,
            },
            topic,
            key,
        ))
    }
}

#[async_trait]
impl TokenVerifier for VerificationService {
    async fn verify(&self, request: &VerifierRequest) -> Result<VerifierResponse, WireError> {
        Ok(self.verify_token(request).await)
    }
}

/// Accept loop for the local plain-TCP verifier listener
pub async fn run_verifier(
    listener: TcpListener,
    service: VerificationService,
    timeout: Duration,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Verifier listening");
    loop {
        let (mut stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Failed to accept verifier connection");
                continue;
            }
        };
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = service.handle_connection(&mut stream, peer, timeout).await {
                warn!(peer = %peer, error = %e, "Verifier session error");
            }
        });
    }
}
