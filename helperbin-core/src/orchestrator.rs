//! The backend seam the client-side state store talks to.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Answer to `binaries_check`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    /// Tools that need a download.
    pub tools: Vec<String>,
    /// Every tool the manifest offers for the current platform.
    pub all_tools: Vec<String>,
}

/// Provisioning backend.
///
/// `ensure` only dispatches: outcomes arrive later on the event stream.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Classifies tools without downloading anything.
    async fn check(&self) -> Result<CheckResult>;

    /// Starts installing `tools`, optionally through download proxies.
    async fn ensure(&self, tools: Vec<String>, use_proxy: bool) -> Result<()>;

    /// All tool names for the current platform.
    async fn list(&self) -> Result<Vec<String>>;
}
