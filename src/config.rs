//! Client and relay configuration.

use std::net::SocketAddr;

use clap::Parser;
use serde::{Deserialize, Serialize};

pub const DEFAULT_API_URL: &str = "http://localhost:8787";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Settings the client needs to talk to its relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    pub user_id: String,
    pub vault_id: String,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ClientConfig {
    pub fn new(user_id: impl Into<String>, vault_id: impl Into<String>) -> Self {
        Self {
            api_url: default_api_url(),
            user_id: user_id.into(),
            vault_id: vault_id.into(),
            request_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Base URL without a trailing slash, ready for path concatenation.
    pub fn base_url(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Command line / environment configuration of the relay binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "notebridge-relay", about = "Message relay with end-to-end key directory")]
pub struct RelayConfig {
    /// Address to listen on.
    #[arg(long, env = "NOTEBRIDGE_LISTEN", default_value = "127.0.0.1:8787")]
    pub listen: SocketAddr,

    /// SQLite database URL.
    #[arg(long, env = "NOTEBRIDGE_DATABASE_URL", default_value = "sqlite://notebridge.db?mode=rwc")]
    pub database_url: String,

    /// Log filter, e.g. `info` or `notebridge_core=debug`.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_filter: String,
}
