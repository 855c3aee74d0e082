//! Engine configuration.
//!
//! [`EngineConfig`] is plain data: it can be deserialized from a config file
//! section or assembled with the `with_*` methods.
//!
//! # Example
//!
//! ```
//! use wsengine::EngineConfig;
//!
//! let config = EngineConfig::new()
//!     .with_addr("127.0.0.1")
//!     .with_port(9999)
//!     .with_serv_id("edge-1");
//!
//! assert_eq!(config.path, "/ws");
//! assert!(config.validate().is_ok());
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default WebSocket upgrade path.
pub const DEFAULT_PATH: &str = "/ws";

// ============================================================================
// EngineConfig
// ============================================================================

/// Listener and registry settings for an [`Engine`](super::Engine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Server identifier, recorded on the engine's tracing span.
    pub serv_id: String,
    /// Bind address; empty binds all interfaces.
    pub addr: String,
    /// Bind port; 0 lets the OS choose.
    pub port: u16,
    /// PEM certificate chain. TLS is enabled when both files are set.
    pub cert_file: Option<PathBuf>,
    /// PEM private key.
    pub key_file: Option<PathBuf>,
    /// WebSocket upgrade path.
    pub path: String,
    /// Session id seed; the first id is `seed + 1`. Current unix time if unset.
    pub id_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            serv_id: String::new(),
            addr: String::new(),
            port: 0,
            cert_file: None,
            key_file: None,
            path: DEFAULT_PATH.to_owned(),
            id_seed: None,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the server identifier.
    #[inline]
    #[must_use]
    pub fn with_serv_id(mut self, serv_id: impl Into<String>) -> Self {
        self.serv_id = serv_id.into();
        self
    }

    /// Sets the bind address.
    #[inline]
    #[must_use]
    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Sets the bind port.
    #[inline]
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Enables TLS with a PEM certificate chain and private key.
    #[inline]
    #[must_use]
    pub fn with_certs(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    /// Sets the upgrade path.
    #[inline]
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Sets the session id seed.
    #[inline]
    #[must_use]
    pub fn with_id_seed(mut self, seed: u64) -> Self {
        self.id_seed = Some(seed);
        self
    }

    /// Returns the certificate and key paths when TLS is configured.
    #[must_use]
    pub fn tls_files(&self) -> Option<(&PathBuf, &PathBuf)> {
        self.cert_file.as_ref().zip(self.key_file.as_ref())
    }

    /// Returns the configured id seed, or the current unix time in seconds.
    #[must_use]
    pub fn resolved_id_seed(&self) -> u64 {
        self.id_seed.unwrap_or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| elapsed.as_secs())
        })
    }

    /// Checks the configuration for mistakes that would only surface at
    /// `start()`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if !self.path.starts_with('/') {
            return Err(Error::config(format!(
                "Upgrade path must start with '/', got {:?}.\n\
                 Example: EngineConfig::new().with_path(\"/ws\")",
                self.path
            )));
        }

        match (&self.cert_file, &self.key_file) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::config(
                    "TLS needs both a certificate and a key file. Use .with_certs(cert, key).",
                ));
            }
            (Some(cert), Some(key)) => {
                for (kind, path) in [("Certificate", cert), ("Key", key)] {
                    if !path.exists() {
                        return Err(Error::config(format!(
                            "{kind} file not found at: {}",
                            path.display()
                        )));
                    }
                }
            }
            (None, None) => {}
        }

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
