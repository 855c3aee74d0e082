//! Builder pattern for engine configuration.
//!
//! Provides a fluent API for configuring and creating [`Engine`] instances.
//!
//! # Example
//!
//! ```no_run
//! use wsengine::{Engine, SessionEvent};
//!
//! # async fn example() -> wsengine::Result<()> {
//! let engine = Engine::builder()
//!     .addr("127.0.0.1")
//!     .port(9999)
//!     .handler(|envelope| {
//!         if let SessionEvent::Message(value) = envelope.event {
//!             envelope.session.send(value);
//!         }
//!     })
//!     .build()?;
//!
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::Span;

use crate::error::Result;
use crate::protocol::{Codec, Envelope, JsonCodec, MessageHandler};
use crate::transport::{SentHook, Session};

use super::config::EngineConfig;
use super::core::Engine;

// ============================================================================
// EngineBuilder
// ============================================================================

/// Builder for configuring an [`Engine`] instance.
///
/// Use [`Engine::builder()`] to create a new builder. Choose the codec with
/// [`codec`](Self::codec) before setting the handler, since the handler's
/// type depends on the codec.
pub struct EngineBuilder<C: Codec = JsonCodec> {
    /// Listener and registry settings.
    config: EngineConfig,
    /// Frame codec.
    codec: C,
    /// Application message handler.
    handler: Option<MessageHandler<C>>,
    /// Post-write hook for outbound messages.
    on_sent: Option<SentHook<C>>,
    /// Parent span for engine tasks.
    span: Option<Span>,
}

impl<C: Codec + fmt::Debug> fmt::Debug for EngineBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("codec", &self.codec)
            .field("handler", &self.handler.is_some())
            .field("on_sent", &self.on_sent.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for EngineBuilder<JsonCodec> {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder<JsonCodec> {
    /// Creates a builder with default configuration and the JSON codec.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            codec: JsonCodec,
            handler: None,
            on_sent: None,
            span: None,
        }
    }
}

// ============================================================================
// EngineBuilder Implementation
// ============================================================================

impl<C: Codec> EngineBuilder<C> {
    /// Replaces the whole configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the server identifier.
    #[inline]
    #[must_use]
    pub fn serv_id(mut self, serv_id: impl Into<String>) -> Self {
        self.config.serv_id = serv_id.into();
        self
    }

    /// Sets the bind address (empty binds all interfaces).
    #[inline]
    #[must_use]
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.config.addr = addr.into();
        self
    }

    /// Sets the bind port (0 lets the OS choose).
    #[inline]
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Enables TLS with a PEM certificate chain and private key.
    #[inline]
    #[must_use]
    pub fn certs(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.config = self.config.with_certs(cert_file, key_file);
        self
    }

    /// Sets the upgrade path.
    #[inline]
    #[must_use]
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Sets the session id seed; the first id is `seed + 1`.
    #[inline]
    #[must_use]
    pub fn id_seed(mut self, seed: u64) -> Self {
        self.config.id_seed = Some(seed);
        self
    }

    /// Sets the parent span for listener and session tasks.
    ///
    /// Defaults to an `info` span named `wsengine` carrying `serv_id`.
    #[inline]
    #[must_use]
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Switches the frame codec.
    ///
    /// Any handler or sent hook set so far is discarded.
    #[must_use]
    pub fn codec<D: Codec>(self, codec: D) -> EngineBuilder<D> {
        EngineBuilder {
            config: self.config,
            codec,
            handler: None,
            on_sent: None,
            span: self.span,
        }
    }

    /// Sets the application message handler.
    #[must_use]
    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(Envelope<C>) + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Sets an already shared handler.
    #[inline]
    #[must_use]
    pub fn shared_handler(mut self, handler: MessageHandler<C>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Sets a hook run after each outbound message is written.
    ///
    /// Messages that fail to encode or write do not trigger it.
    #[must_use]
    pub fn on_sent<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Session<C>>, &C::Message) + Send + Sync + 'static,
    {
        self.on_sent = Some(Arc::new(hook));
        self
    }

    /// Builds the engine with validation. Nothing is bound until
    /// [`Engine::start`].
    ///
    /// # Errors
    ///
    /// - [`Error::Config`](crate::Error::Config) if the path is not absolute
    /// - [`Error::Config`](crate::Error::Config) if only one of certificate
    ///   and key is set, or a file does not exist
    pub fn build(self) -> Result<Engine<C>> {
        self.config.validate()?;

        let span = self
            .span
            .unwrap_or_else(|| tracing::info_span!("wsengine", serv_id = %self.config.serv_id));

        Ok(Engine::new(
            self.config,
            self.codec,
            self.handler,
            self.on_sent,
            span,
        ))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::Error;
    use crate::protocol::RawCodec;

    #[test]
    fn test_new_uses_defaults() {
        let builder = EngineBuilder::new();
        assert_eq!(builder.config, EngineConfig::default());
        assert!(builder.handler.is_none());
        assert!(builder.on_sent.is_none());
        assert!(builder.span.is_none());
    }

    #[test]
    fn test_setters_update_config() {
        let builder = EngineBuilder::new()
            .serv_id("edge-1")
            .addr("127.0.0.1")
            .port(9999)
            .path("/live")
            .id_seed(100);

        assert_eq!(builder.config.serv_id, "edge-1");
        assert_eq!(builder.config.addr, "127.0.0.1");
        assert_eq!(builder.config.port, 9999);
        assert_eq!(builder.config.path, "/live");
        assert_eq!(builder.config.id_seed, Some(100));
    }

    #[test]
    fn test_config_replaces_settings() {
        let config = EngineConfig::new().with_port(1234);
        let builder = EngineBuilder::new().port(1).config(config.clone());
        assert_eq!(builder.config, config);
    }

    #[test]
    fn test_codec_switch_discards_handler() {
        let builder = EngineBuilder::new().handler(|_| {}).codec(RawCodec);
        assert!(builder.handler.is_none());

        let builder = builder.handler(|_| {});
        assert!(builder.handler.is_some());
    }

    #[test]
    fn test_codec_switch_discards_sent_hook() {
        let builder = EngineBuilder::new().on_sent(|_, _| {});
        assert!(builder.on_sent.is_some());

        let builder = builder.codec(RawCodec);
        assert!(builder.on_sent.is_none());
    }

    #[test]
    fn test_build_rejects_relative_path() {
        let err = EngineBuilder::new().path("ws").build().unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_build_rejects_missing_certs() {
        let err = EngineBuilder::new()
            .certs("/nonexistent/cert.pem", "/nonexistent/key.pem")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn test_build_succeeds() {
        let engine = EngineBuilder::new().port(0).id_seed(5).build().unwrap();
        assert_eq!(engine.config().id_seed, Some(5));
        assert_eq!(engine.session_count(), 0);
        assert!(!engine.is_ready());
    }
}
