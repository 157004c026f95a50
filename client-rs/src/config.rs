//! Configuration for the token client

use std::path::PathBuf;
use std::time::Duration;

/// Where to get tokens from and where to keep them
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Issuer address (e.g., "server.local:18883")
    pub issuer_addr: String,

    /// Name the issuer certificate must be valid for
    pub server_name: String,

    /// CA certificate that signed the issuer certificate (PEM)
    pub ca_cert: PathBuf,

    /// Client certificate carrying the `<name>@mqtt.mtd` identity (PEM)
    pub client_cert: PathBuf,

    /// Client private key (PEM)
    pub client_key: PathBuf,

    /// Directory holding one record per (direction, topic)
    pub tokens_dir: PathBuf,

    /// Deadline for connecting and for each read or write
    pub timeout: Duration,
}

impl ClientConfig {
    /// Create a configuration for the given issuer address
    pub fn new(issuer_addr: impl Into<String>) -> Self {
        Self {
            issuer_addr: issuer_addr.into(),
            server_name: "server.local".to_string(),
            ca_cert: PathBuf::from("/mqttmtd/certs/ca/ca.crt"),
            client_cert: PathBuf::from("/mqttmtd/certs/client/client.crt"),
            client_key: PathBuf::from("/mqttmtd/certs/client/client.key"),
            tokens_dir: PathBuf::from("/mqttmtd/tokens"),
            timeout: Duration::from_secs(5),
        }
    }

    /// Set the expected issuer certificate name
    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Set the CA, client certificate and client key paths
    pub fn certs(
        mut self,
        ca: impl Into<PathBuf>,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> Self {
        self.ca_cert = ca.into();
        self.client_cert = cert.into();
        self.client_key = key.into();
        self
    }

    /// Set the token record directory
    pub fn tokens_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tokens_dir = dir.into();
        self
    }

    /// Set the socket timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
