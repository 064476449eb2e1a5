//! File-backed queue storage.
//!
//! The queue is written as one JSON document (`{formatVersion, items}`).
//! Each save goes to a sibling temp file first and is renamed over the
//! target, so a crash mid-write leaves the previous snapshot intact.

use cardsync_engine::{Error, QueueSnapshot, QueueStore};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Stores the offline queue in a JSON file.
#[derive(Debug, Clone)]
pub struct FileQueueStore {
    path: PathBuf,
}

impl FileQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "queue.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl QueueStore for FileQueueStore {
    fn load(&self) -> cardsync_engine::error::Result<QueueSnapshot> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(QueueSnapshot::default());
            }
            Err(e) => return Err(Error::Persistence(e.to_string())),
        };

        serde_json::from_slice(&bytes).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    fn save(&self, snapshot: &QueueSnapshot) -> cardsync_engine::error::Result<()> {
        let persistence = |e: std::io::Error| Error::Persistence(e.to_string());

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(persistence)?;
        }

        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| Error::Persistence(e.to_string()))?;

        let temp = self.temp_path();
        let mut file = fs::File::create(&temp).map_err(persistence)?;
        file.write_all(&json).map_err(persistence)?;
        file.sync_all().map_err(persistence)?;
        drop(file);

        fs::rename(&temp, &self.path).map_err(persistence)?;

        tracing::trace!(path = %self.path.display(), items = snapshot.items.len(), "Queue saved");
        Ok(())
    }
}
