//! Spillway Core - worker pool, caches, and range streaming
//!
//! This crate provides the building blocks of the Spillway gateway: the
//! round-robin pool of authenticated upstream sessions, the channel
//! access-handle resolver with its persistence file, the TTL cache of
//! resolved file locations, and the chunk-fetch streaming engine. The
//! upstream RPC transport itself stays behind the façade traits in
//! [`upstream`].

pub mod access;
pub mod cache;
pub mod config;
pub mod pool;
pub mod streaming;
pub mod tracing_setup;
pub mod upstream;

// Re-export main types for convenient access
pub use access::{AccessError, AccessResolver};
pub use cache::{LocationCache, LocationKey};
pub use config::{ConfigError, GatewayConfig};
pub use pool::{BotCredential, CredentialError, Worker, WorkerPool};
pub use streaming::{BodySink, ByteSink, SinkClosed, StreamError, StreamOutcome, stream_range};
pub use tracing_setup::{CliLogLevel, init_tracing};
pub use upstream::{
    FileDescriptor, ResolveError, UPSTREAM_CHUNK_SIZE, UpstreamApi, UpstreamConnector,
    UpstreamError, WorkerId,
};

/// Errors that can bubble up from any Spillway subsystem.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Configuration parsing or validation errors; fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A bot credential could not be interpreted.
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Channel access-handle resolution failed.
    #[error("channel access error: {0}")]
    Access(#[from] AccessError),

    /// A call through the upstream façade failed.
    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// The streaming engine terminated abnormally.
    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    /// Standard I/O errors from filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type using GatewayError as the error type
pub type Result<T> = std::result::Result<T, GatewayError>;
