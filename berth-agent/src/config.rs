//! Agent configuration.
//!
//! Everything is settable from the environment, with CLI flags layered on
//! top for local runs. A missing access token does not stop the agent from
//! starting, but every authenticated endpoint will refuse requests until
//! one is configured.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Command line arguments for the Berth agent.
#[derive(Parser, Debug)]
#[command(name = "berth-agent")]
#[command(about = "Per-host control-plane agent for Docker Compose stacks")]
pub struct Args {
    /// Shared bearer token required on every API request
    #[arg(long, env = "ACCESS_TOKEN")]
    pub access_token: Option<String>,

    /// Listen port
    #[arg(short, long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory containing one sub-directory per stack
    #[arg(long, env = "STACK_LOCATION", default_value = "/opt/compose")]
    pub stack_location: PathBuf,

    /// Container engine binary
    #[arg(long, env = "DOCKER_BIN", default_value = "docker")]
    pub docker_bin: String,

    /// Base URL of the self-update sidecar
    #[arg(long, env = "SIDECAR_URL", default_value = "https://127.0.0.1:8443")]
    pub sidecar_url: String,

    /// Skip TLS certificate verification towards the sidecar (intra-host
    /// loopback)
    #[arg(long, env = "SIDECAR_INSECURE_TLS", default_value_t = true)]
    pub sidecar_insecure_tls: bool,

    /// Append operation audit records as JSON lines
    #[arg(long, env = "AUDIT_LOG_ENABLED", default_value_t = false)]
    pub audit_log_enabled: bool,

    /// Audit log destination
    #[arg(
        long,
        env = "AUDIT_LOG_FILE_PATH",
        default_value = "/var/log/berth-agent/audit.jsonl"
    )]
    pub audit_log_file_path: PathBuf,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, env = "TLS_CERT_PATH")]
    pub cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, env = "TLS_KEY_PATH")]
    pub key: Option<PathBuf>,

    /// How long completed operations remain queryable, in seconds
    #[arg(long, env = "OPERATION_RETENTION_SECS", default_value_t = 3600)]
    pub operation_retention_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub access_token: Option<String>,
    pub port: u16,
    pub stack_location: PathBuf,
    pub docker_bin: String,
    pub sidecar_url: String,
    pub sidecar_insecure_tls: bool,
    pub audit_log_enabled: bool,
    pub audit_log_file_path: PathBuf,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub operation_retention: Duration,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            access_token: args.access_token,
            port: args.port,
            stack_location: args.stack_location,
            docker_bin: args.docker_bin,
            sidecar_url: args.sidecar_url,
            sidecar_insecure_tls: args.sidecar_insecure_tls,
            audit_log_enabled: args.audit_log_enabled,
            audit_log_file_path: args.audit_log_file_path,
            tls_cert_path: args.cert,
            tls_key_path: args.key,
            operation_retention: Duration::from_secs(args.operation_retention_secs),
        }
    }
}

impl Config {
    /// Parse flags and environment. `.env` files are honoured when present.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        Args::parse().into()
    }
}
