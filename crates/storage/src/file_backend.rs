//! File-based history store: persistent JSON-lines storage.
//!
//! Each session is one file, `<dir>/<session>.jsonl`, with one JSON-encoded
//! `Message` per line. Saving appends a line; loading skips lines that fail
//! to parse rather than discarding the whole history.
//!
//! Storage location: `~/.sleuth/sessions/` unless configured otherwise.

use async_trait::async_trait;
use sleuth_core::error::StorageError;
use sleuth_core::history::HistoryStore;
use sleuth_core::message::{Message, SessionId};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// A file-backed history store.
pub struct FileStore {
    dir: PathBuf,
    // Serialises appends so lines from concurrent saves never interleave
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a store rooted at `dir`; the directory is created on first write.
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a session's history file. Characters outside
    /// `[A-Za-z0-9_-]` are replaced so ids can't escape the directory.
    pub fn session_path(&self, session: &SessionId) -> PathBuf {
        let safe: String = session
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }
}

#[async_trait]
impl HistoryStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn load_history(&self, session: &SessionId) -> Result<Vec<Message>, StorageError> {
        let path = self.session_path(session);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StorageError::Io(format!(
                    "Failed to read {}: {e}",
                    path.display()
                )));
            }
        };

        let messages: Vec<Message> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<Message>(line) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(session_id = %session, error = %e, "Skipping corrupted history line");
                    None
                }
            })
            .collect();

        debug!(session_id = %session, count = messages.len(), "History loaded");
        Ok(messages)
    }

    async fn save_message(&self, session: &SessionId, message: &Message) -> Result<(), StorageError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| StorageError::Corrupt(format!("Failed to serialize message: {e}")))?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to create history directory: {e}")))?;

        let path = self.session_path(session);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::Io(format!("Failed to open {}: {e}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::Io(format!("Failed to write {}: {e}", path.display())))?;
        file.flush()
            .await
            .map_err(|e| StorageError::Io(format!("Failed to flush {}: {e}", path.display())))?;
        Ok(())
    }

    async fn clear_history(&self, session: &SessionId) -> Result<(), StorageError> {
        let path = self.session_path(session);
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(format!(
                "Failed to remove {}: {e}",
                path.display()
            ))),
        }
    }
}
