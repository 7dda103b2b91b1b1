// SPDX-License-Identifier: MIT
//
// Unified error types for Drahtwerk.

use thiserror::Error;

/// Top-level error type for all Drahtwerk operations.
#[derive(Debug, Error)]
pub enum DrahtwerkError {
    // -- Lifecycle errors --
    #[error("another instance is already running: {0}")]
    AlreadyRunning(String),

    #[error("service start failed: {0}")]
    ServiceStart(String),

    #[error("transport error: {0}")]
    Transport(String),

    // -- TLS / certificates --
    #[error("certificate generation failed: {0}")]
    Certificate(String),

    #[error("TLS configuration failed: {0}")]
    Tls(String),

    // -- Document resolution --
    #[error("document has no raw content, inline payload, or URL")]
    UnresolvableDocument,

    #[error("inline payload decode failed: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("document fetch failed: {0}")]
    Fetch(String),

    #[error("print spooling failed: {0}")]
    Spool(String),

    // -- Configuration / persistence --
    #[error("configuration error: {0}")]
    Config(String),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DrahtwerkError>;
