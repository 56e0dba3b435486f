//! On-disk snapshots of finished sessions.
//!
//! Each session is stored as `<dir>/<session_id>.json`. Writes go to a
//! temporary file that is renamed into place while holding an exclusive
//! lock on `<dir>/.lock`, so readers never see a half-written file.
//! Only well-formed session ids map to a path. Every operation does
//! blocking file I/O; async callers go through [`SessionStore::run_blocking`].

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::warn;

use super::{is_session_id, Session, SessionId};
use crate::error::{CodeloopError, Result};

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file shared by all writers in a directory.
const LOCK_FILE: &str = ".lock";

/// Directory of session snapshots.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the snapshot for `session_id`, or `None` when the id is not
    /// a session id.
    #[must_use]
    pub fn session_path(&self, session_id: &str) -> Option<PathBuf> {
        is_session_id(session_id).then(|| self.dir.join(format!("{session_id}.json")))
    }

    /// Run `op` against a clone of this store on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or [`CodeloopError::Other`] if the
    /// blocking task panicked.
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&SessionStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| anyhow::anyhow!("Session store task failed: {e}"))?
    }

    fn lock(&self) -> Result<File> {
        fs::create_dir_all(&self.dir)?;
        let lock_file = File::create(self.dir.join(LOCK_FILE))?;
        FileExt::lock_exclusive(&lock_file)
            .map_err(|e| anyhow::anyhow!("Failed to acquire session store lock: {e}"))?;
        Ok(lock_file)
    }

    /// Write `session` atomically, replacing any previous snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory, lock or file cannot be written.
    pub fn save(&self, session: &Session) -> Result<PathBuf> {
        let target = self.session_path(&session.session_id).ok_or_else(|| {
            CodeloopError::validation(
                "session_id",
                format!("'{}' is not a session id", session.session_id),
            )
        })?;
        let _lock = self.lock()?;

        let tmp_path = self
            .dir
            .join(format!("{}.json{TMP_SUFFIX}", session.session_id));
        let json = serde_json::to_string_pretty(session)?;

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(json.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, &target)?;
        Ok(target)
    }

    /// Load one snapshot.
    ///
    /// Returns `Ok(None)` when no snapshot exists, the id is malformed or
    /// the file is corrupt.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let Some(path) = self.session_path(session_id) else {
            return Ok(None);
        };
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        match serde_json::from_str(&contents) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!("Corrupted session file at {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Ids of all stored snapshots, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read.
    pub fn list_ids(&self) -> Result<Vec<SessionId>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids: Vec<SessionId> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                name.strip_suffix(".json")
                    .filter(|id| is_session_id(id))
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Load every readable snapshot, in id order.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a snapshot cannot be read.
    pub fn load_all(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for id in self.list_ids()? {
            if let Some(session) = self.load(&id)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// Remove a snapshot. Missing snapshots are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`CodeloopError::NotFound`] for malformed ids, or an error if
    /// the file exists but cannot be removed.
    pub fn delete(&self, session_id: &str) -> Result<()> {
        let path = self
            .session_path(session_id)
            .ok_or_else(|| CodeloopError::not_found(session_id))?;
        let _lock = self.lock()?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CodeloopError::Io(e)),
        }
    }
}
