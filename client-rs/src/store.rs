//! Client token store
//!
//! Keeps one record per (direction, topic) under the tokens directory:
//!
//! ```text
//! aead_type(1) [key cursor(2, BE)] timestamp(6) secret(6) * remaining
//! ```
//!
//! The key and cursor are present only when the batch carries an AEAD key. Each fetch pops
//! the first secret and rewrites the record through a temporary file and a rename, so a
//! crash leaves either the old or the new record on disk.

use crate::error::{ClientError, Result};
use crate::issuer::IssuerClient;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use mqttmtd::aead::{AeadKey, AeadType};
use mqttmtd::auth::{stamp_value, AccessType, Secret, Token, SECRET_LEN, STAMP_LEN};
use mqttmtd::wire::{IssuerRequest, IssuerResponse, MAX_TOPIC_LEN};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// What to ask the issuer for when a record has run out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    pub access: AccessType,
    pub aead: AeadType,
    /// Tokens per batch, a multiple of 16 in [16, 496]
    pub batch_size: u16,
}

impl FetchRequest {
    pub fn new(access: AccessType, batch_size: u16) -> Self {
        Self {
            access,
            aead: AeadType::None,
            batch_size,
        }
    }

    pub fn aead(mut self, aead: AeadType) -> Self {
        self.aead = aead;
        self
    }
}

/// Payload key for the token it was returned with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenKey {
    /// Position of the token in its batch, the nonce input for payloads sent with it
    pub index: u16,
    pub key: AeadKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: Token,
    pub key: Option<TokenKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Record {
    key: Option<TokenKey>,
    stamp: [u8; STAMP_LEN],
    secrets: Vec<Secret>,
}

impl Record {
    fn from_response(response: IssuerResponse) -> Self {
        Self {
            key: response.key.map(|key| TokenKey { index: 0, key }),
            stamp: response.timestamp,
            secrets: response.secrets,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 34 + STAMP_LEN + self.secrets.len() * SECRET_LEN);
        match &self.key {
            Some(k) => {
                out.push(k.key.kind.as_u8());
                out.extend_from_slice(k.key.as_bytes());
                out.extend_from_slice(&k.index.to_be_bytes());
            }
            None => out.push(AeadType::None.as_u8()),
        }
        out.extend_from_slice(&self.stamp);
        for secret in &self.secrets {
            out.extend_from_slice(secret.as_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| ClientError::CorruptRecord(what.to_string());

        let (&kind, mut rest) = bytes.split_first().ok_or_else(|| corrupt("empty record"))?;
        let kind = AeadType::from_u8(kind).map_err(|_| corrupt("unknown AEAD type"))?;
        let key = if kind.is_enabled() {
            let len = kind.key_len();
            if rest.len() < len + 2 {
                return Err(corrupt("truncated key header"));
            }
            let key = AeadKey::new(kind, rest[..len].to_vec())?;
            let index = u16::from_be_bytes([rest[len], rest[len + 1]]);
            rest = &rest[len + 2..];
            Some(TokenKey { index, key })
        } else {
            None
        };

        if rest.len() < STAMP_LEN {
            return Err(corrupt("truncated timestamp"));
        }
        let (stamp, secrets) = rest.split_at(STAMP_LEN);
        if secrets.is_empty() || secrets.len() % SECRET_LEN != 0 {
            return Err(corrupt("secrets are not a whole number of tokens"));
        }

        let mut stamp_bytes = [0u8; STAMP_LEN];
        stamp_bytes.copy_from_slice(stamp);
        Ok(Self {
            key,
            stamp: stamp_bytes,
            secrets: secrets
                .chunks_exact(SECRET_LEN)
                .filter_map(Secret::from_slice)
                .collect(),
        })
    }
}

/// Hands out each issued token exactly once, in issuance order, across restarts
pub struct TokenStore {
    dir: PathBuf,
    issuer: Arc<dyn IssuerClient>,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>, issuer: Arc<dyn IssuerClient>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| ClientError::storage(&dir, e))?;
        Ok(Self {
            dir,
            issuer,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record file for a direction and topic
    pub fn record_path(&self, access: AccessType, topic: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", access.tag(), URL_SAFE.encode(topic.as_bytes())))
    }

    /// Next token for `topic`, issuing a new batch when none is stored
    pub async fn fetch(&self, topic: &str, request: &FetchRequest) -> Result<IssuedToken> {
        if topic.is_empty() {
            return Err(ClientError::InvalidRequest("empty topic".to_string()));
        }
        if topic.trim() != topic {
            return Err(ClientError::InvalidRequest(format!(
                "topic {topic:?} has surrounding whitespace"
            )));
        }
        if topic.len() > MAX_TOPIC_LEN {
            return Err(ClientError::InvalidRequest(format!(
                "topic of {} bytes is too long",
                topic.len()
            )));
        }
        let issue = IssuerRequest::new(request.access, request.aead, request.batch_size, topic)
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

        let path = self.record_path(request.access, topic);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        if !exists(&path).await? {
            self.refill(&path, &issue).await?;
        }
        match self.pop(&path).await {
            Err(ClientError::CorruptRecord(reason)) => {
                warn!(path = %path.display(), reason, "Discarding corrupt token record");
                remove(&path).await?;
                self.refill(&path, &issue).await?;
                self.pop(&path).await
            }
            other => other,
        }
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    async fn refill(&self, path: &Path, request: &IssuerRequest) -> Result<()> {
        let response = self.issuer.issue(request).await?;
        let record = Record::from_response(response);
        info!(
            topic = %String::from_utf8_lossy(&request.topic),
            access = %request.access,
            count = record.secrets.len(),
            "Stored new token batch"
        );
        if let Err(e) = write_durable(path, &record.encode()).await {
            let _ = tokio::fs::remove_file(path).await;
            return Err(e);
        }
        Ok(())
    }

    async fn pop(&self, path: &Path) -> Result<IssuedToken> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ClientError::storage(path, e))?;
        let record = Record::decode(&bytes)?;

        let Some((first, rest)) = record.secrets.split_first() else {
            return Err(ClientError::CorruptRecord("no secrets".to_string()));
        };
        let issued = IssuedToken {
            token: Token::new(stamp_value(&record.stamp), *first),
            key: record.key.clone(),
        };

        if rest.is_empty() {
            debug!(path = %path.display(), "Token record exhausted");
            remove(path).await?;
        } else {
            let next = Record {
                key: record.key.map(|k| TokenKey {
                    index: k.index.wrapping_add(1),
                    key: k.key,
                }),
                stamp: record.stamp,
                secrets: rest.to_vec(),
            };
            let staged = stage_record(path, &next.encode()).await?;
            commit(&staged, path).await?;
        }
        Ok(issued)
    }
}

/// Write the replacement record next to `path` without touching `path` itself
pub async fn stage_record(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    if let Err(e) = write_durable(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(tmp)
}

/// Atomically replace `path` with a staged record
pub async fn commit(staged: &Path, path: &Path) -> Result<()> {
    tokio::fs::rename(staged, path)
        .await
        .map_err(|e| ClientError::storage(path, e))
}

async fn write_durable(path: &Path, bytes: &[u8]) -> Result<()> {
    let io = |e| ClientError::storage(path, e);
    let mut file = tokio::fs::File::create(path).await.map_err(io)?;
    file.write_all(bytes).await.map_err(io)?;
    file.sync_all().await.map_err(io)
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| ClientError::storage(path, e))
}

async fn remove(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ClientError::storage(path, e)),
    }
}
