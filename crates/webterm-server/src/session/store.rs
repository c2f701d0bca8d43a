//! Persistence for session records and raw output logs.
//!
//! Records are one JSON file per session under `<data>/sessions/`, written
//! atomically (temp file + rename) so a crash never leaves a torn record.
//! Raw logs are append-only files under `<data>/logs/<id>/raw.log`; a live
//! session keeps its log open until it is released.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use webterm_core::{SessionRecord, WebtermError, WebtermResult};

/// Durable table of session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, record: &SessionRecord) -> WebtermResult<()>;
    async fn load_all(&self) -> WebtermResult<Vec<SessionRecord>>;
    async fn delete(&self, id: &str) -> WebtermResult<()>;
}

/// Append-only raw output per session.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Where the log of `id` lives (recorded on the session record).
    fn path_for(&self, id: &str) -> PathBuf;
    async fn append(&self, id: &str, bytes: &[u8]) -> WebtermResult<()>;
    /// Whole log; empty when nothing was ever written.
    async fn read_all(&self, id: &str) -> WebtermResult<Vec<u8>>;
    async fn clear(&self, id: &str) -> WebtermResult<()>;
    /// Remove the log entirely.
    async fn discard(&self, id: &str) -> WebtermResult<()>;
    /// Nothing more will be appended for `id` for now; drop any open handle.
    async fn release(&self, _id: &str) {}
}

fn storage_err(context: &str, path: &Path, e: std::io::Error) -> WebtermError {
    WebtermError::Storage(format!("{context} {}: {e}", path.display()))
}

/// Reject ids that could escape the store directory.
fn checked_id(id: &str) -> WebtermResult<&str> {
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(WebtermError::SessionNotFound(id.to_string()));
    }
    Ok(id)
}

/// One JSON file per record.
pub struct JsonSessionStore {
    dir: PathBuf,
}

impl JsonSessionStore {
    pub async fn open(dir: impl Into<PathBuf>) -> WebtermResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_err("failed to create", &dir, e))?;
        Ok(Self { dir })
    }

    fn record_path(&self, id: &str) -> WebtermResult<PathBuf> {
        Ok(self.dir.join(format!("{}.json", checked_id(id)?)))
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn save(&self, record: &SessionRecord) -> WebtermResult<()> {
        let path = self.record_path(&record.id)?;
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp_path, &json)
            .await
            .map_err(|e| storage_err("failed to write", &tmp_path, e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| storage_err("failed to replace", &path, e))?;
        debug!(session_id = %record.id, status = %record.status, "session record saved");
        Ok(())
    }

    async fn load_all(&self) -> WebtermResult<Vec<SessionRecord>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| storage_err("failed to list", &self.dir, e))?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable session record");
                    continue;
                }
            };
            match serde_json::from_slice::<SessionRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping malformed session record"),
            }
        }
        Ok(records)
    }

    async fn delete(&self, id: &str) -> WebtermResult<()> {
        let path = self.record_path(id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("failed to delete", &path, e)),
        }
    }
}

/// Raw logs as plain files.
pub struct FileLogStore {
    root: PathBuf,
    /// Append handles of sessions that are still producing output.
    writers: Mutex<HashMap<String, Arc<Mutex<File>>>>,
}

impl FileLogStore {
    pub async fn open(root: impl Into<PathBuf>) -> WebtermResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| storage_err("failed to create", &root, e))?;
        Ok(Self {
            root,
            writers: Mutex::new(HashMap::new()),
        })
    }

    fn dir_for(&self, id: &str) -> WebtermResult<PathBuf> {
        Ok(self.root.join(checked_id(id)?))
    }

    async fn writer(&self, id: &str) -> WebtermResult<Arc<Mutex<File>>> {
        let mut writers = self.writers.lock().await;
        if let Some(file) = writers.get(id) {
            return Ok(file.clone());
        }
        let dir = self.dir_for(id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_err("failed to create", &dir, e))?;
        let path = dir.join("raw.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| storage_err("failed to open", &path, e))?;
        debug!(session_id = id, path = %path.display(), "session log opened");
        let file = Arc::new(Mutex::new(file));
        writers.insert(id.to_string(), file.clone());
        Ok(file)
    }

    #[cfg(test)]
    async fn open_writers(&self) -> usize {
        self.writers.lock().await.len()
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(id).join("raw.log")
    }

    async fn append(&self, id: &str, bytes: &[u8]) -> WebtermResult<()> {
        let file = self.writer(id).await?;
        let mut file = file.lock().await;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_all(&self, id: &str) -> WebtermResult<Vec<u8>> {
        let path = self.dir_for(id)?.join("raw.log");
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(storage_err("failed to read", &path, e)),
        }
    }

    async fn clear(&self, id: &str) -> WebtermResult<()> {
        // Appends after this land at the new end of file.
        let path = self.dir_for(id)?.join("raw.log");
        match fs::OpenOptions::new().write(true).truncate(true).open(&path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("failed to truncate", &path, e)),
        }
    }

    async fn discard(&self, id: &str) -> WebtermResult<()> {
        let dir = self.dir_for(id)?;
        self.writers.lock().await.remove(id);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("failed to remove", &dir, e)),
        }
    }

    async fn release(&self, id: &str) {
        if self.writers.lock().await.remove(id).is_some() {
            debug!(session_id = id, "session log closed");
        }
    }
}

#[cfg(test)]
pub(crate) mod memory {
    //! In-memory doubles for registry and runtime tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemorySessionStore {
        pub records: Mutex<HashMap<String, SessionRecord>>,
    }

    impl MemorySessionStore {
        pub fn with(records: Vec<SessionRecord>) -> Self {
            Self {
                records: Mutex::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
            }
        }

        pub fn get(&self, id: &str) -> Option<SessionRecord> {
            self.records.lock().unwrap().get(id).cloned()
        }
    }

    #[async_trait]
    impl SessionStore for MemorySessionStore {
        async fn save(&self, record: &SessionRecord) -> WebtermResult<()> {
            self.records.lock().unwrap().insert(record.id.clone(), record.clone());
            Ok(())
        }

        async fn load_all(&self) -> WebtermResult<Vec<SessionRecord>> {
            Ok(self.records.lock().unwrap().values().cloned().collect())
        }

        async fn delete(&self, id: &str) -> WebtermResult<()> {
            self.records.lock().unwrap().remove(id);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemoryLogStore {
        pub logs: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl LogStore for MemoryLogStore {
        fn path_for(&self, id: &str) -> PathBuf {
            PathBuf::from("memory").join(id).join("raw.log")
        }

        async fn append(&self, id: &str, bytes: &[u8]) -> WebtermResult<()> {
            self.logs.lock().unwrap().entry(id.to_string()).or_default().extend_from_slice(bytes);
            Ok(())
        }

        async fn read_all(&self, id: &str) -> WebtermResult<Vec<u8>> {
            Ok(self.logs.lock().unwrap().get(id).cloned().unwrap_or_default())
        }

        async fn clear(&self, id: &str) -> WebtermResult<()> {
            if let Some(log) = self.logs.lock().unwrap().get_mut(id) {
                log.clear();
            }
            Ok(())
        }

        async fn discard(&self, id: &str) -> WebtermResult<()> {
            self.logs.lock().unwrap().remove(id);
            Ok(())
        }
    }
}
