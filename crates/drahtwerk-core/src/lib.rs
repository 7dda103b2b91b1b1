// SPDX-License-Identifier: MIT
//
// Drahtwerk — core types and error definitions shared across all crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BridgeConfig, ConfigSource, FileConfigSource};
pub use error::DrahtwerkError;
pub use types::*;

/// Process-wide application identity, used for the single-instance lock.
pub const APP_ID: &str = "drahtwerk";

/// Crate version reported on startup and over the API.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
