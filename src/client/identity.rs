//! Persistent session identity.
//!
//! One opaque token per client installation, created on first use and
//! reused for every connection afterwards so the upstream service can
//! resume session-scoped state across page reloads, restarts, and network
//! drops. The token lives in a small state file under the platform data
//! directory; tests point the store at a temp path instead.

use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

const STATE_DIR: &str = "voice-relay";
const TOKEN_FILE: &str = "session_id";

/// File-backed create-if-absent store for the session token.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Store under the platform data directory (falling back to the current
    /// directory when none is available, e.g. minimal containers).
    pub fn new() -> Self {
        let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: base.join(STATE_DIR).join(TOKEN_FILE),
        }
    }

    /// Store at an explicit path. Used by tests and non-standard installs.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Return the persisted token, creating and persisting a fresh one on
    /// first use. An existing token is never regenerated.
    pub fn load_or_create(&self) -> io::Result<String> {
        if let Ok(contents) = fs::read_to_string(&self.path) {
            let token = contents.trim();
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }

        let token = Uuid::new_v4().to_string();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, &token)?;
        info!(path = %self.path.display(), "created new session identity");
        Ok(token)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_created_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::with_path(dir.path().join("session_id"));

        let first = store.load_or_create().unwrap();
        let second = store.load_or_create().unwrap();

        assert!(!first.is_empty());
        assert_eq!(first, second);
    }

    #[test]
    fn test_existing_token_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_id");
        fs::write(&path, "abc-123\n").unwrap();

        let store = SessionStore::with_path(&path);
        assert_eq!(store.load_or_create().unwrap(), "abc-123");
    }

    #[test]
    fn test_blank_file_gets_a_fresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session_id");
        fs::write(&path, "   \n").unwrap();

        let store = SessionStore::with_path(&path);
        let token = store.load_or_create().unwrap();
        assert!(Uuid::parse_str(&token).is_ok());
    }

    #[test]
    fn test_missing_parent_directories_are_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state").join("session_id");

        let store = SessionStore::with_path(&path);
        assert!(store.load_or_create().is_ok());
        assert!(path.exists());
    }
}
