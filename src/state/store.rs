//! Snapshot persistence behind the `StateStore` seam.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use crate::config::Config;
use crate::pipeline::{SessionPipelineState, SCHEMA_VERSION};
use crate::{shlog_debug, shlog_trace, shlog_warn, Error, Result};

use super::journal::{self, PipelineEvent};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Persistence for per-session snapshots and journals.
///
/// `transaction` is the only way to read-modify-write a snapshot: the closure
/// runs while the session is held exclusively, and the slot it leaves behind
/// is written back (`Some`) or deleted (`None`).
pub trait StateStore {
    /// Read a snapshot without locking. Unreadable snapshots read as `None`.
    fn load(&self, session_id: &str) -> Result<Option<SessionPipelineState>>;

    fn save(&self, session_id: &str, state: &SessionPipelineState) -> Result<()>;

    /// Remove the snapshot and journal of a session.
    fn delete(&self, session_id: &str) -> Result<()>;

    fn transaction<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Option<SessionPipelineState>) -> T,
    ) -> Result<T>;

    fn append_event(&self, session_id: &str, event: &PipelineEvent) -> Result<()>;

    fn load_events(&self, session_id: &str) -> Result<Vec<PipelineEvent>>;
}

/// Restrict a session id to characters safe in a file name.
pub fn sanitize_session_id(session_id: &str) -> String {
    let cleaned: String = session_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

/// One JSON snapshot per session under a state directory.
///
/// Layout: `<dir>/<id>.json`, `<dir>/<id>.lock`, `<dir>/<id>.events.jsonl`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
    lock_timeout: Duration,
    stale_after: Duration,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let defaults = Config::default();
        Self {
            dir: dir.into(),
            lock_timeout: defaults.lock_timeout(),
            stale_after: defaults.stale_lock_age(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(config.state_dir()?)
            .with_lock_timeout(config.lock_timeout())
            .with_stale_after(config.stale_lock_age()))
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after = age;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", sanitize_session_id(session_id)))
    }

    pub fn journal_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.events.jsonl", sanitize_session_id(session_id)))
    }

    fn lock_path(&self, session_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.lock", sanitize_session_id(session_id)))
    }

    /// Parse a snapshot, distinguishing "absent" from "corrupt".
    fn read_snapshot(&self, session_id: &str) -> Result<Option<SessionPipelineState>> {
        let path = self.snapshot_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)?;
        let state: SessionPipelineState =
            serde_json::from_str(&contents).map_err(|e| Error::StateCorrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if state.schema_version > SCHEMA_VERSION {
            return Err(Error::StateCorrupt {
                path,
                reason: format!(
                    "schema version {} is newer than {}",
                    state.schema_version, SCHEMA_VERSION
                ),
            });
        }
        Ok(Some(state))
    }

    fn write_snapshot(&self, session_id: &str, state: &SessionPipelineState) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.snapshot_path(session_id);
        let temp_path = self.dir.join(format!(
            "{}.json.{}.tmp",
            sanitize_session_id(session_id),
            uuid::Uuid::new_v4()
        ));
        let contents = serde_json::to_string_pretty(state)?;
        fs::write(&temp_path, &contents)?;
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e.into());
        }
        shlog_trace!("store: saved {}", path.display());
        Ok(())
    }

    /// Take the session lock. The lock file holds a random token naming its owner.
    fn acquire(&self, session_id: &str) -> Result<LockGuard> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path(session_id);
        let token = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let guard = LockGuard { path, token };
                    file.write_all(guard.token.as_bytes())?;
                    return Ok(guard);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Ok(seen) = fs::read_to_string(&path) {
                        if self.is_stale(&path) && reclaim(&path, &seen) {
                            shlog_warn!("store: reclaimed stale lock {}", path.display());
                            continue;
                        }
                    }
                    let waited = started.elapsed();
                    if waited >= self.lock_timeout {
                        return Err(Error::LockTimeout { path, waited });
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn is_stale(&self, lock: &Path) -> bool {
        fs::metadata(lock)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .map(|age| age > self.stale_after)
            .unwrap_or(false)
    }
}

/// Move a stale lock out of the way.
///
/// The rename is atomic, so of several waiters only one moves any given file.
/// If the file moved is not the one judged stale (another waiter reclaimed it
/// first and took the lock), it is linked back and `false` is returned.
fn reclaim(lock: &Path, seen: &str) -> bool {
    let mut aside = lock.as_os_str().to_owned();
    aside.push(format!(".{}.stale", uuid::Uuid::new_v4()));
    let aside = PathBuf::from(aside);
    if fs::rename(lock, &aside).is_err() {
        return false;
    }
    let moved = fs::read_to_string(&aside).unwrap_or_default();
    let reclaimed = moved == seen;
    if !reclaimed {
        let _ = fs::hard_link(&aside, lock);
    }
    let _ = fs::remove_file(&aside);
    reclaimed
}

/// Removes the lock file when dropped, unless another process has taken it over.
struct LockGuard {
    path: PathBuf,
    token: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(owner) if owner == self.token => {
                let _ = fs::remove_file(&self.path);
            }
            Ok(_) => shlog_warn!("store: lock {} was taken over, leaving it", self.path.display()),
            Err(_) => {}
        }
    }
}

impl StateStore for FileStateStore {
    fn load(&self, session_id: &str) -> Result<Option<SessionPipelineState>> {
        match self.read_snapshot(session_id) {
            Err(Error::StateCorrupt { path, reason }) => {
                shlog_warn!("store: discarding {}: {}", path.display(), reason);
                Ok(None)
            }
            other => other,
        }
    }

    fn save(&self, session_id: &str, state: &SessionPipelineState) -> Result<()> {
        let _lock = self.acquire(session_id)?;
        self.write_snapshot(session_id, state)
    }

    fn delete(&self, session_id: &str) -> Result<()> {
        let _lock = self.acquire(session_id)?;
        for path in [self.snapshot_path(session_id), self.journal_path(session_id)] {
            match fs::remove_file(&path) {
                Ok(()) => shlog_debug!("store: removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn transaction<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Option<SessionPipelineState>) -> T,
    ) -> Result<T> {
        let _lock = self.acquire(session_id)?;
        let original = self.load(session_id)?;
        let mut slot = original.clone();
        let out = f(&mut slot);

        match (&original, &slot) {
            (_, Some(state)) if original.as_ref() != Some(state) => {
                self.write_snapshot(session_id, state)?;
            }
            (Some(_), None) => {
                let _ = fs::remove_file(self.snapshot_path(session_id));
                let _ = fs::remove_file(self.journal_path(session_id));
            }
            _ => {}
        }
        Ok(out)
    }

    fn append_event(&self, session_id: &str, event: &PipelineEvent) -> Result<()> {
        journal::append(&self.journal_path(session_id), event)
    }

    fn load_events(&self, session_id: &str) -> Result<Vec<PipelineEvent>> {
        journal::read(&self.journal_path(session_id))
    }
}

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    snapshots: Mutex<HashMap<String, SessionPipelineState>>,
    journals: Mutex<HashMap<String, Vec<PipelineEvent>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self, session_id: &str) -> Result<Option<SessionPipelineState>> {
        let snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        Ok(snapshots.get(session_id).cloned())
    }

    fn save(&self, session_id: &str, state: &SessionPipelineState) -> Result<()> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        snapshots.insert(session_id.to_string(), state.clone());
        Ok(())
    }

    fn delete(&self, session_id: &str) -> Result<()> {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        self.journals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);
        Ok(())
    }

    fn transaction<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Option<SessionPipelineState>) -> T,
    ) -> Result<T> {
        let mut snapshots = self.snapshots.lock().unwrap_or_else(|e| e.into_inner());
        let mut slot = snapshots.get(session_id).cloned();
        let out = f(&mut slot);
        match slot {
            Some(state) => {
                snapshots.insert(session_id.to_string(), state);
            }
            None => {
                if snapshots.remove(session_id).is_some() {
                    self.journals
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(session_id);
                }
            }
        }
        Ok(out)
    }

    fn append_event(&self, session_id: &str, event: &PipelineEvent) -> Result<()> {
        self.journals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    fn load_events(&self, session_id: &str) -> Result<Vec<PipelineEvent>> {
        Ok(self
            .journals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}
