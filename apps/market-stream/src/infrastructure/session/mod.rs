//! Session Stores
//!
//! Adapters for the [`SessionStore`] port. The connection id assigned by
//! the feed is kept between runs so a restarted process can resume its
//! session.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::application::ports::{SessionError, SessionStore};

// =============================================================================
// In-Memory
// =============================================================================

/// In-memory session store.
///
/// Suitable for testing and for processes that do not need to resume.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    connection_id: RwLock<Option<String>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `connection_id`.
    #[must_use]
    pub fn with_connection_id(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: RwLock::new(Some(connection_id.into())),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Option<String> {
        self.connection_id.read().clone()
    }

    fn save(&self, connection_id: &str) -> Result<(), SessionError> {
        *self.connection_id.write() = Some(connection_id.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        *self.connection_id.write() = None;
        Ok(())
    }
}

// =============================================================================
// File
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRecord {
    connection_id: String,
    saved_at: DateTime<Utc>,
}

/// JSON file session store.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash never leaves a half-written session behind.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    /// Store backed by `path`. The file is created on first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Option<String> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read session file");
                return None;
            }
        };

        match serde_json::from_str::<SessionRecord>(&contents) {
            Ok(record) => Some(record.connection_id),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring corrupt session file");
                None
            }
        }
    }

    fn save(&self, connection_id: &str) -> Result<(), SessionError> {
        let record = SessionRecord {
            connection_id: connection_id.to_string(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&record)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::debug!(path = %self.path.display(), "Session saved");
        Ok(())
    }

    fn clear(&self) -> Result<(), SessionError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
