//! Session-token persistence.
//!
//! Tokens are an opaque list of cookie records serialized to a single JSON
//! file. The store never interprets them; it only survives them across
//! process restarts. Both operations fail soft: a missing, empty, or corrupt
//! file loads as "no session" (and a corrupt file is deleted so the next run
//! doesn't re-parse the same garbage), and a failed save is logged without
//! aborting the session that produced it.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One persisted cookie record. Content is opaque to this crate; it is only
/// stored and replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store under `~/.linkpilot/session_tokens.json`, falling back to the
    /// working directory when no home directory can be resolved.
    pub fn default_location() -> Self {
        let path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".linkpilot")
            .join("session_tokens.json");
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read persisted tokens. Missing, empty, or malformed content all yield
    /// an empty vec; malformed content is deleted on detection.
    pub fn load(&self) -> Vec<SessionToken> {
        if !self.path.exists() {
            return Vec::new();
        }
        let content = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) => {
                warn!("session_store: failed to read {}: {}", self.path.display(), e);
                return Vec::new();
            }
        };
        if content.trim().is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<Vec<SessionToken>>(&content) {
            Ok(tokens) => {
                info!(
                    "session_store: loaded {} tokens from {}",
                    tokens.len(),
                    self.path.display()
                );
                tokens
            }
            Err(e) => {
                warn!(
                    "session_store: corrupt token file {} ({}) — deleting",
                    self.path.display(),
                    e
                );
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(
                        "session_store: failed to delete corrupt file {}: {}",
                        self.path.display(),
                        e
                    );
                }
                Vec::new()
            }
        }
    }

    /// Overwrite the persisted token set. Atomic (temp file + rename) so a
    /// crash mid-write never leaves a half-written file; failures are logged
    /// and swallowed — persistence trouble must not fail an otherwise-valid
    /// session.
    pub fn save(&self, tokens: &[SessionToken]) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!("session_store: failed to create {}: {}", parent.display(), e);
                return;
            }
        }

        let json = match serde_json::to_string_pretty(tokens) {
            Ok(s) => s,
            Err(e) => {
                warn!("session_store: serialization failed: {}", e);
                return;
            }
        };

        let tmp = self.path.with_extension("tmp");
        if let Err(e) = std::fs::write(&tmp, &json) {
            warn!("session_store: failed to write {}: {}", tmp.display(), e);
            return;
        }
        match std::fs::rename(&tmp, &self.path) {
            Ok(()) => info!(
                "session_store: saved {} tokens to {}",
                tokens.len(),
                self.path.display()
            ),
            Err(e) => warn!(
                "session_store: failed to rename {} -> {}: {}",
                tmp.display(),
                self.path.display(),
                e
            ),
        }
    }
}
