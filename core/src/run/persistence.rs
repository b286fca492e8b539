//! Session persistence - one file per run
//!
//! Directory structure:
//! ```text
//! .agtop/
//!   sessions/
//!     {run_id}.json   # Run snapshot plus log file paths
//!   logs/
//!     {run_id}.stdout.log
//!     {run_id}.stderr.log
//! ```
//!
//! Writes replace the whole file. Reads skip anything that fails to parse,
//! so a writer that died mid-write costs one session, never the whole load.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::run_model::{validate_run_id, Run};
use crate::{Error, Result};

const SESSION_EXT: &str = "json";

/// On-disk record of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFile {
    pub run: Run,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_log_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_log_path: Option<PathBuf>,
}

impl SessionFile {
    pub fn new(run: Run) -> Self {
        Self {
            run,
            stdout_log_path: None,
            stderr_log_path: None,
        }
    }

    pub fn with_logs(mut self, stdout: PathBuf, stderr: PathBuf) -> Self {
        self.stdout_log_path = Some(stdout);
        self.stderr_log_path = Some(stderr);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run.id
    }

    /// Log files recorded for this session
    pub fn log_paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.stdout_log_path
            .iter()
            .chain(self.stderr_log_path.iter())
    }
}

/// File-backed session store
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Create a store rooted at the sessions directory
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", run_id, SESSION_EXT))
    }

    /// Write a session, replacing any previous copy
    pub fn save(&self, session: &SessionFile) -> Result<()> {
        validate_run_id(session.run_id())?;
        fs::create_dir_all(&self.dir)?;

        let path = self.session_path(session.run_id());
        let tmp = path.with_extension(format!("{}.tmp", SESSION_EXT));
        let data = serde_json::to_vec_pretty(session)?;

        fs::write(&tmp, data)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| Error::storage(&path, format!("Failed to write session: {}", e)))?;

        debug!("Saved session: {}", path.display());
        Ok(())
    }

    /// Load one session; `Ok(None)` when the file does not exist
    pub fn load_one(&self, run_id: &str) -> Result<Option<SessionFile>> {
        let path = self.session_path(run_id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| Error::storage(&path, format!("Failed to parse session: {}", e)))
    }

    /// Load every session, skipping unreadable or corrupt files
    pub fn load(&self) -> Result<Vec<SessionFile>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Failed to read session directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SESSION_EXT) {
                continue;
            }

            let data = match fs::read(&path) {
                Ok(d) => d,
                Err(e) => {
                    warn!("Failed to read session {}: {}", path.display(), e);
                    continue;
                }
            };

            match serde_json::from_slice::<SessionFile>(&data) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    warn!("Skipping corrupt session {}: {}", path.display(), e);
                    continue;
                }
            }
        }

        sessions.sort_by(|a, b| a.run.created_at.cmp(&b.run.created_at));
        Ok(sessions)
    }

    /// Delete a run's session file. Missing files are not an error.
    pub fn remove(&self, run_id: &str) -> Result<()> {
        let path = self.session_path(run_id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!("Removed session: {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Best-effort removal of a file; a missing file counts as removed
pub fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunState;
    use tempfile::TempDir;

    fn create_test_store() -> (SessionStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = SessionStore::new(temp.path().join("sessions"));
        (store, temp)
    }

    #[test]
    fn test_save_and_load() {
        let (store, temp) = create_test_store();
        let mut run = Run::with_id("abc123", "Do the thing");
        run.state = RunState::Running;
        run.pid = 77;

        let session = SessionFile::new(run).with_logs(
            temp.path().join("abc123.stdout.log"),
            temp.path().join("abc123.stderr.log"),
        );
        store.save(&session).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], session);
        assert_eq!(loaded[0].log_paths().count(), 2);
    }

    #[test]
    fn test_load_missing_dir_is_empty() {
        let (store, _temp) = create_test_store();
        assert!(store.load().unwrap().is_empty());
        assert!(store.load_one("nope").unwrap().is_none());
    }

    #[test]
    fn test_save_replaces_previous() {
        let (store, _temp) = create_test_store();
        let mut run = Run::with_id("r1", "x");
        store.save(&SessionFile::new(run.clone())).unwrap();

        run.state = RunState::Routing;
        store.save(&SessionFile::new(run)).unwrap();

        let loaded = store.load_one("r1").unwrap().unwrap();
        assert_eq!(loaded.run.state, RunState::Routing);
        assert_eq!(store.load().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_files_are_skipped() {
        let (store, _temp) = create_test_store();
        store.save(&SessionFile::new(Run::with_id("good", "x"))).unwrap();
        fs::write(store.dir().join("bad.json"), "{ not json").unwrap();
        fs::write(store.dir().join("truncated.json"), r#"{"run": {"id": "t""#).unwrap();
        fs::write(store.dir().join("notes.txt"), "ignored").unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].run_id(), "good");
        assert!(store.load_one("bad").is_err());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (store, _temp) = create_test_store();
        store.save(&SessionFile::new(Run::with_id("r1", "x"))).unwrap();

        store.remove("r1").unwrap();
        assert!(store.load_one("r1").unwrap().is_none());
        store.remove("r1").unwrap();
    }

    #[test]
    fn test_invalid_run_id_not_written() {
        let (store, _temp) = create_test_store();
        let session = SessionFile::new(Run::with_id("../escape", "x"));
        assert!(store.save(&session).is_err());
    }

    #[test]
    fn test_remove_file_if_exists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.log");
        remove_file_if_exists(&path).unwrap();
        fs::write(&path, "data").unwrap();
        remove_file_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
