//! Configuration for Conclave.
//!
//! Provides the [`ConclaveConfig`] struct for configuring where
//! [`ThoughtChain`](crate::thought_chain::ThoughtChain) logs, the
//! [`MemoryStore`](crate::MemoryStore) category files, and
//! [`SessionStore`](crate::SessionStore) histories live on disk. Users
//! construct this manually — no file parsing dependency is introduced for
//! it; `mcp.json` (a genuinely external contract) is still read with plain
//! `serde_json`, see [`crate::mcp_pool`].
//!
//! # Example
//!
//! ```rust
//! use conclave::ConclaveConfig;
//! use std::path::PathBuf;
//!
//! // Use the defaults (".memory", "conversations", "thought_chains", all
//! // relative to the current directory).
//! let config = ConclaveConfig::default();
//!
//! // Or override individual roots.
//! let config = ConclaveConfig {
//!     memory_root: PathBuf::from("/var/data/memory"),
//!     ..ConclaveConfig::default()
//! };
//! ```

use std::path::PathBuf;

/// Global configuration for Conclave's on-disk persistence layers.
///
/// This struct is intentionally minimal and users construct it however they
/// want. No TOML, YAML, or other config-file parsing dependencies are
/// introduced.
pub struct ConclaveConfig {
    /// Root directory for per-conversation [`MemoryStore`](crate::MemoryStore)
    /// category files: `<memory_root>/<cid>/<category>.json`.
    pub memory_root: PathBuf,
    /// Root directory for per-conversation agent session histories:
    /// `<conversations_root>/<cid>/<agent-name>.session`.
    pub conversations_root: PathBuf,
    /// Directory where [`ThoughtChain`](crate::thought_chain::ThoughtChain)
    /// `.jsonl` files are stored. Passed to
    /// [`ThoughtChain::open`](crate::thought_chain::ThoughtChain::open) as
    /// the `chain_dir` argument.
    pub thought_chain_dir: PathBuf,
}

impl Default for ConclaveConfig {
    /// `.memory`, `conversations`, and `thought_chains`, all relative to the
    /// current working directory.
    ///
    /// # Example
    ///
    /// ```rust
    /// use conclave::ConclaveConfig;
    /// use std::path::PathBuf;
    ///
    /// let config = ConclaveConfig::default();
    /// assert_eq!(config.memory_root, PathBuf::from(".memory"));
    /// assert_eq!(config.conversations_root, PathBuf::from("conversations"));
    /// assert_eq!(config.thought_chain_dir, PathBuf::from("thought_chains"));
    /// ```
    fn default() -> Self {
        Self {
            memory_root: PathBuf::from(".memory"),
            conversations_root: PathBuf::from("conversations"),
            thought_chain_dir: PathBuf::from("thought_chains"),
        }
    }
}
