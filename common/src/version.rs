//! Build and protocol version reported by every rank when joining a group

use serde::{Deserialize, Serialize};

/// Version carried in the group handshake.
///
/// Ranks of one group must run the same build of `bcast`: the semantic version
/// decides compatibility, git information is only used in diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolVersion {
    /// Semantic version from Cargo.toml (e.g., "0.1.0")
    pub semantic: String,

    /// Git describe output (e.g., "v0.1.0-3-g1a2b3c4-dirty"), absent for builds outside git
    #[serde(default)]
    pub git_describe: Option<String>,

    /// Full git commit hash
    #[serde(default)]
    pub git_hash: Option<String>,
}

impl ProtocolVersion {
    /// Version of the running binary, git fields are filled in by build.rs when available.
    pub fn current() -> Self {
        Self {
            semantic: env!("CARGO_PKG_VERSION").to_string(),
            git_describe: option_env!("BCAST_GIT_DESCRIBE").map(String::from),
            git_hash: option_env!("BCAST_GIT_HASH").map(String::from),
        }
    }

    /// Exact semantic version match.
    ///
    /// ```
    /// use common::version::ProtocolVersion;
    ///
    /// let ours = ProtocolVersion {
    ///     semantic: "0.1.0".to_string(),
    ///     git_describe: None,
    ///     git_hash: None,
    /// };
    /// let theirs = ProtocolVersion {
    ///     semantic: "0.1.0".to_string(),
    ///     git_describe: Some("v0.1.0-3-g1a2b3c4".to_string()),
    ///     git_hash: None,
    /// };
    /// assert!(ours.is_compatible_with(&theirs));
    /// ```
    pub fn is_compatible_with(&self, other: &Self) -> bool {
        self.semantic == other.semantic
    }

    pub fn display(&self) -> String {
        match self.git_describe {
            Some(ref git_describe) => format!("{} ({})", self.semantic, git_describe),
            None => self.semantic.clone(),
        }
    }

    /// Serialize to JSON string
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn to_json(&self) -> anyhow::Result<String> {
        serde_json::to_string(self)
            .map_err(|e| anyhow::anyhow!("failed to serialize version: {:#}", e))
    }

    /// Deserialize from JSON string
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or misses the semantic version.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| anyhow::anyhow!("failed to parse version JSON: {:#}", e))
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}
