//! Proxy configuration shared between the control channel and the detours.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::SockAddr;

use crate::endpoint::Endpoint;
use crate::error::Result;

/// Snapshot of what the controller wants this process to do.
///
/// The default snapshot is the degraded mode: nothing is proxied and nothing
/// is reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// SOCKS5 proxy to redirect through
    #[serde(default)]
    pub proxy: Option<Endpoint>,
    /// Report every outbound connection attempt to the controller
    #[serde(default)]
    pub log: bool,
    /// Report created subprocesses so the controller can inject them too
    #[serde(default)]
    pub subprocess: bool,
}

impl ProxyConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the proxy endpoint.
    pub fn with_proxy(mut self, proxy: Endpoint) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Enable or disable connection logging.
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.log = enabled;
        self
    }

    /// Enable or disable subprocess reporting.
    pub fn with_subprocess(mut self, enabled: bool) -> Self {
        self.subprocess = enabled;
        self
    }

    /// Native address of the proxy. A domain proxy has none and disables
    /// redirection.
    pub fn proxy_native(&self) -> Option<SockAddr> {
        self.proxy.as_ref().and_then(Endpoint::to_native)
    }

    /// Load a snapshot from JSON, e.g. `{"proxy": "127.0.0.1:1080", "log": true}`.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Mutex-protected [`ProxyConfig`] cell.
///
/// Readers get a copy, writers replace the whole value, so a reader never
/// sees half of an update.
#[derive(Debug, Default)]
pub struct ConfigCell {
    inner: Mutex<ProxyConfig>,
}

impl ConfigCell {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            inner: Mutex::new(config),
        }
    }

    /// Copy of the current snapshot.
    pub fn get(&self) -> ProxyConfig {
        self.inner.lock().clone()
    }

    /// Replace the snapshot.
    pub fn set(&self, config: ProxyConfig) {
        *self.inner.lock() = config;
    }

    /// Drop back to the default snapshot.
    pub fn reset(&self) {
        self.set(ProxyConfig::default());
    }
}
