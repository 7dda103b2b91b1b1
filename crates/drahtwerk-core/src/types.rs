// SPDX-License-Identifier: MIT
//
// Core domain types for the Drahtwerk bridge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A print request as received from a web client.
///
/// Exactly one of three content sources determines how the document is
/// resolved, checked in this order:
///
/// 1. `raw_content` — already-usable content, no resolution happens;
/// 2. `file_content` — base64 payload decoded to the cache path derived
///    from `url`;
/// 3. `url` alone — fetched over the network to the same derived path.
///
/// A document with none of the three is unresolvable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintDocument {
    /// Target printer name.
    pub printer: String,
    /// Source URL; also keys the cache path for inline payloads.
    #[serde(default)]
    pub url: Option<String>,
    /// Inline base64-encoded document payload.
    #[serde(default)]
    pub file_content: Option<String>,
    /// Raw content that needs no resolution (e.g. ESC/POS byte strings).
    #[serde(default)]
    pub raw_content: Option<String>,
    /// Client-side correlation id, echoed back in the result.
    #[serde(default)]
    pub id: Option<String>,
}

impl PrintDocument {
    pub fn has_raw_content(&self) -> bool {
        self.raw_content.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn has_file_content(&self) -> bool {
        self.file_content.as_deref().is_some_and(|s| !s.is_empty())
    }

    pub fn has_url(&self) -> bool {
        self.url.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Outcome of a print job, reported back on the printer channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintResult {
    pub id: Option<String>,
    pub printer: String,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Lifecycle state of an individual service or the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

/// Supervisor control-loop state.
///
/// `Stopped → Running → {Restarting → Running | Stopping → Stopped}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
    Stopped,
    Running,
    Restarting,
    Stopping,
}
