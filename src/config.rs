//! Bridge configuration: a TOML file with defaults for every field, then
//! command-line overrides on top.
//!
//! ```toml
//! listen = "127.0.0.1:8787"
//! api_key = "optional-shared-secret"
//!
//! [timeouts]
//! accept_secs = 30
//!
//! [[endpoints]]
//! address = "http://127.0.0.1:11434"
//! model = "deepseek-r1:latest"
//!
//! [[endpoints]]
//! address = "http://10.0.0.7:11434"
//! model = "deepseek-r1:1.5b"
//! ```
//!
//! Endpoint order is failover priority.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;
use crate::providers::Endpoint;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8787";
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Timeouts, in whole seconds.
///
/// - `connect_secs`: TCP connect to a backend (default 10)
/// - `accept_secs`: request sent to response headers received; exceeding it
///   rejects the endpoint and moves to the next one (default 30)
/// - `idle_secs`: longest gap between backend chunks once streaming (default 120)
/// - `client_idle_secs`: longest gap between bridge chunks on the client (default 120)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub connect_secs: u64,
    pub accept_secs: u64,
    pub idle_secs: u64,
    pub client_idle_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            accept_secs: 30,
            idle_secs: 120,
            client_idle_secs: 120,
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn accept(&self) -> Duration {
        Duration::from_secs(self.accept_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn client_idle(&self) -> Duration {
        Duration::from_secs(self.client_idle_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub listen: SocketAddr,
    /// When set, requests must carry `Authorization: Bearer <api_key>`.
    pub api_key: Option<String>,
    pub max_body_bytes: usize,
    pub timeouts: Timeouts,
    pub endpoints: Vec<Endpoint>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
            api_key: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            timeouts: Timeouts::default(),
            endpoints: vec![Endpoint::new("http://127.0.0.1:11434", "deepseek-r1:latest")],
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, BridgeError> {
        toml::from_str(content).map_err(|e| BridgeError::Config(e.to_string()))
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BridgeError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Apply command-line overrides. A non-empty `endpoints` list replaces
    /// the configured one wholesale; order is preserved.
    pub fn with_overrides(
        mut self,
        listen: Option<SocketAddr>,
        endpoints: Vec<Endpoint>,
        api_key: Option<String>,
    ) -> Self {
        if let Some(listen) = listen {
            self.listen = listen;
        }
        if !endpoints.is_empty() {
            self.endpoints = endpoints;
        }
        if api_key.is_some() {
            self.api_key = api_key;
        }
        self
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.endpoints.is_empty() {
            return Err(BridgeError::NoEndpoints);
        }
        if let Some(ep) = self
            .endpoints
            .iter()
            .find(|ep| !(ep.address.starts_with("http://") || ep.address.starts_with("https://")))
        {
            return Err(BridgeError::Config(format!(
                "endpoint address must be an http(s) URL: {}",
                ep.address
            )));
        }
        let t = &self.timeouts;
        if t.connect_secs == 0 || t.accept_secs == 0 || t.idle_secs == 0 || t.client_idle_secs == 0 {
            return Err(BridgeError::Config("timeouts must be at least one second".into()));
        }
        if self.max_body_bytes == 0 {
            return Err(BridgeError::Config("max_body_bytes must be positive".into()));
        }
        if matches!(self.api_key.as_deref(), Some("")) {
            return Err(BridgeError::Config("api_key must not be empty".into()));
        }
        Ok(())
    }
}
