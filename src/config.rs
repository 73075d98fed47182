//! Runtime configuration.
//!
//! Options come from flags or `COURIER_*` environment variables; `.env` is
//! loaded by the binary before parsing. Secret-bearing values are held as
//! `SecretString` so they never land in debug output.

use std::path::PathBuf;

use clap::Parser;
use secrecy::SecretString;

use crate::channel::ChannelType;
use crate::error::ConfigError;
use crate::httpx::NetworkPolicy;

fn parse_secret(value: &str) -> Result<SecretString, std::convert::Infallible> {
    Ok(SecretString::from(value.to_string()))
}

#[derive(Debug, Clone, Parser)]
#[command(name = "courier", about = "Messaging gateway", disable_version_flag = true)]
pub struct Config {
    /// Which backend implementation to run against.
    #[arg(long, env = "COURIER_BACKEND", default_value = "memory")]
    pub backend: String,

    /// Interface to bind.
    #[arg(long, env = "COURIER_ADDRESS", default_value = "0.0.0.0")]
    pub address: String,

    /// Port to listen on. 0 picks an ephemeral port.
    #[arg(long, env = "COURIER_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Database URL for backends that need one.
    #[arg(long, env = "COURIER_DB", value_parser = parse_secret)]
    pub db: Option<SecretString>,

    /// Queue/cache URL for backends that need one.
    #[arg(long, env = "COURIER_REDIS", value_parser = parse_secret)]
    pub redis: Option<SecretString>,

    /// Directory for the durability spool.
    #[arg(long, env = "COURIER_SPOOL_DIR", default_value = "/var/spool/courier")]
    pub spool_dir: PathBuf,

    /// Number of concurrent senders.
    #[arg(long, env = "COURIER_MAX_WORKERS", default_value_t = crate::sender::DEFAULT_MAX_WORKERS)]
    pub max_workers: usize,

    /// Comma-separated IPs and CIDR ranges outbound fetches may not touch.
    #[arg(
        long,
        env = "COURIER_DISALLOWED_NETWORKS",
        default_value = "127.0.0.1,::1,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16,169.254.0.0/16"
    )]
    pub disallowed_networks: String,

    /// Domain attachment URLs are served from.
    #[arg(long, env = "COURIER_MEDIA_DOMAIN", default_value = "")]
    pub media_domain: String,

    /// AWS region for attachment storage.
    #[arg(long, env = "COURIER_AWS_REGION", default_value = "us-east-1")]
    pub aws_region: String,

    /// AWS access key id, blank to use the instance role.
    #[arg(long, env = "COURIER_AWS_ACCESS_KEY_ID", default_value = "")]
    pub aws_access_key_id: String,

    /// AWS secret access key.
    #[arg(long, env = "COURIER_AWS_SECRET_ACCESS_KEY", value_parser = parse_secret)]
    pub aws_secret_access_key: Option<SecretString>,

    /// Custom S3 endpoint, for minio-style deployments.
    #[arg(long, env = "COURIER_S3_ENDPOINT", default_value = "")]
    pub s3_endpoint: String,

    /// Custom DynamoDB endpoint.
    #[arg(long, env = "COURIER_DYNAMO_ENDPOINT", default_value = "")]
    pub dynamo_endpoint: String,

    /// Username for the basic-auth `/status` page.
    #[arg(long, env = "COURIER_STATUS_USERNAME", default_value = "")]
    pub status_username: String,

    /// Password for the basic-auth `/status` page.
    #[arg(long, env = "COURIER_STATUS_PASSWORD", value_parser = parse_secret)]
    pub status_password: Option<SecretString>,

    /// Bearer token protecting the fetch-attachment endpoint.
    #[arg(long, env = "COURIER_AUTH_TOKEN", value_parser = parse_secret)]
    pub auth_token: Option<SecretString>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, env = "COURIER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Version string reported on the index page.
    #[arg(long, env = "COURIER_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub version: String,

    /// Comma-separated channel type tags to serve; empty means all.
    #[arg(long, env = "COURIER_INCLUDE_CHANNELS", default_value = "")]
    pub include_channels: String,

    /// Comma-separated channel type tags to never serve.
    #[arg(long, env = "COURIER_EXCLUDE_CHANNELS", default_value = "")]
    pub exclude_channels: String,
}

impl Config {
    /// A config suitable for tests: memory backend, ephemeral port, temp
    /// spool, no denied networks so tests can talk to localhost stubs.
    pub fn for_testing(spool_dir: PathBuf) -> Self {
        let mut config = Config::parse_from(["courier"]);
        config.address = "127.0.0.1".to_string();
        config.port = 0;
        config.spool_dir = spool_dir;
        config.max_workers = 2;
        config.disallowed_networks = String::new();
        config
    }

    /// Set the fetch-attachment bearer token.
    pub fn with_auth_token(mut self, token: &str) -> Self {
        self.auth_token = Some(SecretString::from(token.to_string()));
        self
    }

    /// Set the `/status` basic-auth credentials.
    pub fn with_status_auth(mut self, username: &str, password: &str) -> Self {
        self.status_username = username.to_string();
        self.status_password = Some(SecretString::from(password.to_string()));
        self
    }

    /// Parse the disallowed-networks list into a policy.
    pub fn network_policy(&self) -> Result<NetworkPolicy, ConfigError> {
        let entries: Vec<String> = self
            .disallowed_networks
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        NetworkPolicy::parse(&entries)
    }

    pub fn include_list(&self) -> Result<Vec<ChannelType>, ConfigError> {
        parse_tags(&self.include_channels)
    }

    pub fn exclude_list(&self) -> Result<Vec<ChannelType>, ConfigError> {
        parse_tags(&self.exclude_channels)
    }
}

fn parse_tags(value: &str) -> Result<Vec<ChannelType>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}
