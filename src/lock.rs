//! Cross-run exclusion through a lock file.
//!
//! The file is created with `create_new`, so at most one process can hold it.
//! It carries the holder's identity and acquisition time; a lock older than
//! the configured maximum age is considered abandoned and reclaimed.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Contents of the lock file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockMarker {
    pub owner_id: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl LockMarker {
    fn new() -> Self {
        Self {
            owner_id: Uuid::new_v4(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        }
    }

    pub fn read(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let marker: LockMarker = serde_json::from_slice(&data)?;
        Ok(marker)
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.acquired_at
    }

    /// Held longer than `max_age` and eligible for reclaim
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.age(now) > max_age_limit(max_age)
    }
}

/// `max_age` as a signed duration, saturating for absurdly large settings
fn max_age_limit(max_age: Duration) -> chrono::Duration {
    let secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX).min(i64::MAX / 1000);
    chrono::Duration::seconds(secs)
}

/// What a caller sees when inspecting the lock without taking it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held(LockMarker),
    /// Lock file present but unreadable, e.g. a crash mid-write
    Unreadable,
}

#[derive(Debug, Clone)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inspect(&self) -> LockState {
        if !self.path.exists() {
            return LockState::Free;
        }
        match LockMarker::read(&self.path) {
            Ok(marker) => LockState::Held(marker),
            Err(_) => LockState::Unreadable,
        }
    }

    /// Take the lock, reclaiming it if the current holder is older than
    /// `max_age`. Returns [`Error::LockBusy`] while a live holder exists.
    pub fn acquire(&self, max_age: Duration) -> Result<RunLockGuard> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let marker = LockMarker::new();
        if self.try_create(&marker)? {
            debug!("Lock {} acquired by {}", self.path.display(), marker.owner_id);
            return Ok(self.guard(marker, None));
        }

        let (holder, age) = self.current_holder()?;
        if holder.is_none() && !self.path.exists() {
            // Released between the two checks
            if self.try_create(&marker)? {
                return Ok(self.guard(marker, None));
            }
        }

        let max_age = max_age_limit(max_age);
        if age <= max_age {
            return Err(Error::LockBusy {
                owner: holder.map(|h| h.owner_id.to_string()).unwrap_or_else(|| "unknown".to_string()),
                age_secs: age.num_seconds(),
            });
        }

        warn!(
            "Reclaiming stale lock {} (age {}s exceeds {}s)",
            self.path.display(),
            age.num_seconds(),
            max_age.num_seconds()
        );
        self.remove_stale(holder.as_ref(), max_age)?;
        let reclaimed = Reclaimed {
            previous_owner: holder.map(|h| h.owner_id),
            age_secs: age.num_seconds(),
        };

        // Another run may have reclaimed it in the meantime
        if self.try_create(&marker)? {
            info!("Stale lock reclaimed by {}", marker.owner_id);
            return Ok(self.guard(marker, Some(reclaimed)));
        }

        let (holder, age) = self.current_holder()?;
        Err(Error::LockBusy {
            owner: holder.map(|h| h.owner_id.to_string()).unwrap_or_else(|| "unknown".to_string()),
            age_secs: age.num_seconds(),
        })
    }

    fn guard(&self, marker: LockMarker, reclaimed: Option<Reclaimed>) -> RunLockGuard {
        RunLockGuard {
            path: self.path.clone(),
            marker,
            reclaimed,
            released: false,
        }
    }

    /// Atomically create the lock file. `Ok(false)` if it already exists.
    fn try_create(&self, marker: &LockMarker) -> Result<bool> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let data = serde_json::to_vec_pretty(marker)?;
        file.write_all(&data)?;
        file.sync_all()?;
        Ok(true)
    }

    /// Current holder and its age. An unreadable marker is aged by the
    /// file's modification time.
    fn current_holder(&self) -> Result<(Option<LockMarker>, chrono::Duration)> {
        let now = Utc::now();
        match LockMarker::read(&self.path) {
            Ok(marker) => {
                let age = marker.age(now);
                Ok((Some(marker), age))
            }
            Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => Ok((None, chrono::Duration::zero())),
            Err(_) => {
                let modified = match fs::metadata(&self.path).and_then(|m| m.modified()) {
                    Ok(modified) => DateTime::<Utc>::from(modified),
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok((None, chrono::Duration::zero())),
                    Err(e) => return Err(e.into()),
                };
                Ok((None, now - modified))
            }
        }
    }

    /// Move the stale file aside and delete it only if it is still the lock
    /// judged stale: same owner, or still unreadable and still older than
    /// `max_age`. Anything else is put back and reported as busy.
    fn remove_stale(&self, judged: Option<&LockMarker>, max_age: chrono::Duration) -> Result<()> {
        let aside = self
            .path
            .with_extension(format!("stale-{}", Uuid::new_v4().simple()));

        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let now = Utc::now();
        let (still_stale, moved, age) = match (judged, LockMarker::read(&aside)) {
            (Some(judged), Ok(moved)) => {
                let age = moved.age(now);
                (judged.owner_id == moved.owner_id, Some(moved), age)
            }
            // A readable marker replaced the crashed one in the meantime
            (None, Ok(moved)) => {
                let age = moved.age(now);
                (false, Some(moved), age)
            }
            (Some(_), Err(_)) => (false, None, chrono::Duration::zero()),
            (None, Err(_)) => {
                let age = fs::metadata(&aside)
                    .and_then(|m| m.modified())
                    .map(|modified| now - DateTime::<Utc>::from(modified))
                    .unwrap_or_else(|_| chrono::Duration::zero());
                (age > max_age, None, age)
            }
        };

        if still_stale {
            fs::remove_file(&aside)?;
            return Ok(());
        }

        let owner = moved
            .as_ref()
            .map(|m| m.owner_id.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        warn!("Lock changed hands while reclaiming, restoring holder {}", owner);
        match fs::hard_link(&aside, &self.path) {
            Ok(()) => {}
            Err(e) => warn!("Could not restore lock {}: {}", self.path.display(), e),
        }
        let _ = fs::remove_file(&aside);

        Err(Error::LockBusy {
            owner,
            age_secs: age.num_seconds(),
        })
    }
}

/// A stale holder that was evicted to take the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reclaimed {
    pub previous_owner: Option<Uuid>,
    pub age_secs: i64,
}

/// Held lock; released on drop so every exit path gives it back
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    marker: LockMarker,
    reclaimed: Option<Reclaimed>,
    released: bool,
}

impl RunLockGuard {
    pub fn marker(&self) -> &LockMarker {
        &self.marker
    }

    pub fn reclaimed(&self) -> Option<&Reclaimed> {
        self.reclaimed.as_ref()
    }

    /// Release explicitly, surfacing any error
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.remove_if_owned()
    }

    fn remove_if_owned(&self) -> Result<()> {
        match LockMarker::read(&self.path) {
            Ok(current) if current.owner_id == self.marker.owner_id => {
                fs::remove_file(&self.path)?;
                debug!("Lock {} released", self.path.display());
                Ok(())
            }
            Ok(current) => {
                warn!(
                    "Lock {} now owned by {}, leaving it in place",
                    self.path.display(),
                    current.owner_id
                );
                Ok(())
            }
            Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.remove_if_owned() {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn write_marker(path: &Path, acquired_at: DateTime<Utc>) -> LockMarker {
        let marker = LockMarker {
            owner_id: Uuid::new_v4(),
            pid: 1,
            acquired_at,
        };
        fs::write(path, serde_json::to_vec(&marker).unwrap()).unwrap();
        marker
    }

    #[test]
    fn test_acquire_and_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock = RunLock::new(&temp_dir.path().join("run.lock"));

        let guard = lock.acquire(HOUR).unwrap();
        assert!(guard.reclaimed().is_none());
        assert!(matches!(lock.inspect(), LockState::Held(ref m) if m == guard.marker()));

        guard.release().unwrap();
        assert_eq!(lock.inspect(), LockState::Free);
    }

    #[test]
    fn test_second_acquire_is_busy() {
        let temp_dir = TempDir::new().unwrap();
        let lock = RunLock::new(&temp_dir.path().join("run.lock"));

        let _first = lock.acquire(HOUR).unwrap();
        let second = lock.acquire(HOUR);
        assert!(matches!(second, Err(Error::LockBusy { .. })));
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run.lock");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || RunLock::new(&path).acquire(HOUR).map(std::mem::forget).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_drop_releases() {
        let temp_dir = TempDir::new().unwrap();
        let lock = RunLock::new(&temp_dir.path().join("run.lock"));

        {
            let _guard = lock.acquire(HOUR).unwrap();
        }
        assert_eq!(lock.inspect(), LockState::Free);
        lock.acquire(HOUR).unwrap();
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run.lock");
        let old = write_marker(&path, Utc::now() - chrono::Duration::hours(7));

        let lock = RunLock::new(&path);
        let guard = lock.acquire(Duration::from_secs(6 * 3600)).unwrap();
        assert_ne!(guard.marker().owner_id, old.owner_id);
        let reclaimed = guard.reclaimed().unwrap();
        assert_eq!(reclaimed.previous_owner, Some(old.owner_id));
        assert!(reclaimed.age_secs >= 7 * 3600);

        let leftovers = fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_fresh_lock_not_reclaimed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run.lock");
        let held = write_marker(&path, Utc::now() - chrono::Duration::minutes(5));

        let err = RunLock::new(&path).acquire(HOUR).unwrap_err();
        match err {
            Error::LockBusy { owner, .. } => assert_eq!(owner, held.owner_id.to_string()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unreadable_fresh_lock_is_busy() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run.lock");
        fs::write(&path, b"{ truncated").unwrap();

        let lock = RunLock::new(&path);
        assert_eq!(lock.inspect(), LockState::Unreadable);
        assert!(matches!(lock.acquire(HOUR), Err(Error::LockBusy { .. })));
    }

    #[test]
    fn test_reclaim_of_crashed_lock_spares_new_holder() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run.lock");

        // Another run already replaced the crashed marker with its own
        let holder = RunLock::new(&path).acquire(HOUR).unwrap();

        let late = RunLock::new(&path);
        let err = late.remove_stale(None, chrono::Duration::hours(1)).unwrap_err();
        assert!(matches!(err, Error::LockBusy { ref owner, .. } if *owner == holder.marker().owner_id.to_string()));
        assert!(matches!(late.inspect(), LockState::Held(ref m) if m == holder.marker()));

        let marker = LockMarker::new();
        assert!(!late.try_create(&marker).unwrap());
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_reclaim_keeps_fresh_unreadable_lock() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run.lock");
        // Created by `create_new` but not yet written
        fs::write(&path, b"").unwrap();

        let lock = RunLock::new(&path);
        let err = lock.remove_stale(None, chrono::Duration::hours(1)).unwrap_err();
        assert!(matches!(err, Error::LockBusy { .. }));
        assert_eq!(lock.inspect(), LockState::Unreadable);
    }

    #[test]
    fn test_reclaim_restores_lock_that_changed_owner() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run.lock");
        let judged = write_marker(&path, Utc::now() - chrono::Duration::hours(7));
        let replacement = write_marker(&path, Utc::now());

        let lock = RunLock::new(&path);
        let err = lock.remove_stale(Some(&judged), chrono::Duration::hours(6)).unwrap_err();
        assert!(matches!(err, Error::LockBusy { .. }));
        assert!(matches!(lock.inspect(), LockState::Held(m) if m == replacement));
    }

    #[test]
    fn test_old_unreadable_lock_reclaimed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run.lock");
        fs::write(&path, b"{ truncated").unwrap();
        let old = std::time::SystemTime::now() - Duration::from_secs(7 * 3600);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(old)
            .unwrap();

        let guard = RunLock::new(&path).acquire(Duration::from_secs(6 * 3600)).unwrap();
        let reclaimed = guard.reclaimed().unwrap();
        assert_eq!(reclaimed.previous_owner, None);
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_marker_staleness_saturates() {
        let mut marker = LockMarker::new();
        marker.acquired_at = Utc::now() - chrono::Duration::hours(7);
        let now = Utc::now();

        assert!(marker.is_stale(now, Duration::from_secs(6 * 3600)));
        assert!(!marker.is_stale(now, Duration::from_secs(8 * 3600)));
        assert!(!marker.is_stale(now, Duration::from_secs(u64::MAX)));
    }

    #[test]
    fn test_guard_leaves_foreign_lock() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run.lock");
        let lock = RunLock::new(&path);

        let guard = lock.acquire(HOUR).unwrap();
        let foreign = write_marker(&path, Utc::now());
        drop(guard);

        assert!(matches!(lock.inspect(), LockState::Held(m) if m == foreign));
    }
}
