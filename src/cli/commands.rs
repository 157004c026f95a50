//! CLI command definitions

use clap::{Parser, Subcommand};
use mqttmtd::storage::StorageMode;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mqttmtd")]
#[command(about = "Moving-target-defense token server and MQTT proxy", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level, used when RUST_LOG is not set
    #[arg(long, env = "MQTTMTD_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the token issuer and verifier
    Authserver {
        /// Address of the mTLS issuer listener
        #[arg(long, env = "MQTTMTD_ISSUER_ADDR", default_value = "0.0.0.0:18883")]
        issuer_addr: SocketAddr,

        /// Address of the local verifier listener
        #[arg(long, env = "MQTTMTD_VERIFIER_ADDR", default_value = "127.0.0.1:18884")]
        verifier_addr: SocketAddr,

        /// CA certificate used to verify clients (PEM)
        #[arg(long, env = "MQTTMTD_CA_CERT")]
        ca: PathBuf,

        /// Server certificate (PEM)
        #[arg(long, env = "MQTTMTD_SERVER_CERT")]
        cert: PathBuf,

        /// Server private key (PEM)
        #[arg(long, env = "MQTTMTD_SERVER_KEY")]
        key: PathBuf,

        /// Access-control list (YAML)
        #[arg(long, env = "MQTTMTD_ACL")]
        acl: PathBuf,

        /// Where token secrets are kept between verifications
        #[arg(long, env = "MQTTMTD_STORAGE", value_enum, default_value = "memory")]
        storage: StorageMode,

        /// Directory for file-backed secrets
        #[arg(long, env = "MQTTMTD_TOKENS_DIR", default_value = "./tokens")]
        tokens_dir: PathBuf,

        /// Socket timeout for client-facing connections, in milliseconds (0 = none)
        #[arg(long, env = "MQTTMTD_EXTERNAL_TIMEOUT_MS", default_value_t = 5000)]
        external_timeout_ms: u64,

        /// Socket timeout for proxy-facing connections, in milliseconds (0 = none)
        #[arg(long, env = "MQTTMTD_LOCAL_TIMEOUT_MS", default_value_t = 1000)]
        local_timeout_ms: u64,

        /// Seconds between expiry sweeps
        #[arg(long, env = "MQTTMTD_SWEEP_SECS", default_value_t = 60)]
        sweep_secs: u64,

        /// Seconds a grant stays valid after issuance
        #[arg(long, env = "MQTTMTD_HORIZON_SECS", default_value_t = 604_800)]
        horizon_secs: u64,
    },

    /// Run the MQTT proxy in front of a broker
    Proxy {
        /// Address to accept MQTT clients on
        #[arg(short, long, env = "MQTTMTD_PROXY_ADDR", default_value = "0.0.0.0:1883")]
        bind: SocketAddr,

        /// Broker to relay to
        #[arg(long, env = "MQTTMTD_BROKER_ADDR", default_value = "127.0.0.1:11883")]
        broker: SocketAddr,

        /// Verifier listener of the auth server
        #[arg(long, env = "MQTTMTD_VERIFIER_ADDR", default_value = "127.0.0.1:18884")]
        verifier: SocketAddr,

        /// Socket timeout for client and broker connections, in milliseconds (0 = none)
        #[arg(long, env = "MQTTMTD_EXTERNAL_TIMEOUT_MS", default_value_t = 5000)]
        timeout_ms: u64,

        /// Socket timeout for verifier exchanges, in milliseconds (0 = none)
        #[arg(long, env = "MQTTMTD_LOCAL_TIMEOUT_MS", default_value_t = 1000)]
        verifier_timeout_ms: u64,

        /// Seconds either side of a session may stay silent before it is closed
        #[arg(
            long,
            env = "MQTTMTD_IDLE_TIMEOUT_SECS",
            default_value_t = 90,
            value_parser = clap::value_parser!(u64).range(1..)
        )]
        idle_timeout_secs: u64,

        /// Largest frame body accepted, in bytes
        #[arg(long, env = "MQTTMTD_MAX_FRAME", default_value_t = 65536)]
        max_frame: usize,
    },

    /// Load an ACL file and print its entries
    Acl {
        /// ACL file (YAML)
        path: PathBuf,
    },
}
