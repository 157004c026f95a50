//! MQTT-MTD token client
//!
//! Fetches single-use topic tokens from the issuer over mutual TLS and keeps the unused
//! remainder of each batch on disk, handing every token out exactly once.
//!
//! # Example
//!
//! ```no_run
//! use mqttmtd_client::{ClientConfig, FetchRequest, TlsIssuerClient, TokenStore};
//! use mqttmtd::auth::AccessType;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClientConfig::new("server.local:18883")
//!         .certs("ca.crt", "client.crt", "client.key")
//!         .tokens_dir("./tokens");
//!     let issuer = Arc::new(TlsIssuerClient::new(&config)?);
//!     let store = TokenStore::new(&config.tokens_dir, issuer)?;
//!
//!     // Publish on "sensors/temp" using the token text as the topic name
//!     let issued = store
//!         .fetch("sensors/temp", &FetchRequest::new(AccessType::Publish, 16))
//!         .await?;
//!     println!("{}", issued.token.to_base64());
//!
//!     Ok(())
//! }
//! ```

mod config;
mod error;
mod issuer;
mod store;

pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use issuer::{IssuerClient, TlsIssuerClient};
pub use store::{commit, stage_record, FetchRequest, IssuedToken, TokenKey, TokenStore};
