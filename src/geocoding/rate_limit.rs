//! Minimum-interval rate limiting, in-process and across processes.
//!
//! Cluster workers are separate OS processes sharing one provider quota, so
//! an in-memory limiter alone is not enough. [`RateLimiter`] combines:
//!
//! 1. An in-process queue: a mutex around the last call instant, held while
//!    waiting, so threads of one process go through one at a time.
//! 2. An advisory lock-file protocol in a shared directory:
//!
//! ```text
//! <dir>/<name>.lock   created with O_CREAT|O_EXCL, holds the owner pid
//! <dir>/<name>.last   last call time, nanoseconds since the Unix epoch
//! ```
//!
//! A caller creates `.lock` (retrying while it exists), reads `.last`,
//! sleeps until `last + interval`, writes the new `.last` and removes `.lock`.
//! A `.lock` older than the staleness timeout is assumed to belong to a dead
//! process. It is broken by renaming it to a unique name first, so of
//! several callers seeing the same stale lock only one removes it, and a
//! fresh lock taken in between is put back. No OS-level `flock` is used so
//! the protocol works the same on every platform and network filesystem.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const POLL: Duration = Duration::from_millis(5);

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

/// Remove `path` if it is older than `stale_after`. True when this caller
/// broke it.
fn break_stale(path: &Path, stale_after: Duration) -> bool {
    if !age(path).is_some_and(|a| a > stale_after) {
        return false;
    }
    let aside = path.with_extension(format!("lock.stale-{}-{}", std::process::id(), now_ns()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
        Err(e) => {
            tracing::warn!(lock = %path.display(), error = %e, "could not break stale lock");
            return false;
        }
    }
    // Renamed a lock someone took after our age check: hand it back.
    let stale = age(&aside).is_some_and(|a| a > stale_after);
    if !stale && let Err(e) = fs::hard_link(&aside, path) {
        tracing::warn!(lock = %path.display(), error = %e, "could not restore live lock");
    }
    if let Err(e) = fs::remove_file(&aside) {
        tracing::warn!(path = %aside.display(), error = %e, "could not remove broken lock");
    }
    if stale {
        tracing::debug!(lock = %path.display(), "removed stale rate-limit lock");
    }
    stale
}

/// Advisory lock plus last-call timestamp shared through the filesystem.
#[derive(Debug, Clone)]
pub struct FileLock {
    dir: PathBuf,
    name: String,
    stale_after: Duration,
}

/// Held lock; the lock file is removed on drop.
#[derive(Debug)]
pub struct FileLockGuard {
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl FileLock {
    pub fn new(dir: impl Into<PathBuf>, name: &str, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            name: name.to_string(),
            stale_after,
        }
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.name))
    }

    pub fn stamp_path(&self) -> PathBuf {
        self.dir.join(format!("{}.last", self.name))
    }

    /// Block until the lock file is ours.
    pub fn acquire(&self) -> io::Result<FileLockGuard> {
        fs::create_dir_all(&self.dir)?;
        let path = self.lock_path();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(FileLockGuard { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !break_stale(&path, self.stale_after) {
                        std::thread::sleep(POLL);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Last recorded call, if any.
    pub fn last_call_ns(&self) -> Option<u64> {
        fs::read_to_string(self.stamp_path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn record_call(&self, at_ns: u64) -> io::Result<()> {
        fs::write(self.stamp_path(), at_ns.to_string())
    }

    /// Wait out `interval` since the last call recorded by any process.
    pub fn wait_turn(&self, interval: Duration) -> io::Result<()> {
        let _guard = self.acquire()?;
        if let Some(last) = self.last_call_ns() {
            let due = last.saturating_add(interval.as_nanos() as u64);
            loop {
                let now = now_ns();
                if now >= due {
                    break;
                }
                std::thread::sleep(Duration::from_nanos(due - now));
            }
        }
        self.record_call(now_ns())
    }
}

/// Remove lock files in `dir` older than `stale_after`. Returns how many
/// were removed.
pub fn sweep_stale(dir: &Path, stale_after: Duration) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "lock"))
        .filter(|p| break_stale(p, stale_after))
        .count()
}

/// Enforces a minimum interval between calls to one provider.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
    shared: Option<FileLock>,
}

impl RateLimiter {
    /// In-process limiting only.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
            shared: None,
        }
    }

    /// In-process plus cross-process limiting through `lock`.
    pub fn shared(interval: Duration, lock: FileLock) -> Self {
        Self {
            shared: Some(lock),
            ..Self::new(interval)
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Block until a call may start, then claim the slot.
    ///
    /// A broken shared lock directory degrades to in-process limiting with a
    /// warning rather than failing the lookup.
    pub fn acquire(&self) {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        if let Some(lock) = &self.shared
            && let Err(e) = lock.wait_turn(self.interval)
        {
            tracing::warn!(error = %e, "cross-process rate limit unavailable");
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn in_process_calls_are_spaced() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(40)));
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.acquire())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(3 * 40));
    }

    #[test]
    fn separate_limiters_share_interval_through_files() {
        // One limiter per thread stands in for one limiter per process.
        let tmp = TempDir::new().unwrap();
        let interval = Duration::from_millis(50);
        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = FileLock::new(tmp.path(), "provider", Duration::from_secs(10));
                std::thread::spawn(move || RateLimiter::shared(interval, lock).acquire())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(start.elapsed() >= 3 * interval);
        assert!(!tmp.path().join("provider.lock").exists());
        assert!(tmp.path().join("provider.last").exists());
    }

    #[test]
    fn stale_lock_is_broken() {
        let tmp = TempDir::new().unwrap();
        let lock = FileLock::new(tmp.path(), "p", Duration::from_millis(20));
        fs::write(lock.lock_path(), "99999").unwrap();
        std::thread::sleep(Duration::from_millis(60));

        let started = Instant::now();
        let guard = lock.acquire().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        drop(guard);
        assert!(!lock.lock_path().exists());
    }

    #[test]
    fn racing_breakers_leave_no_leftovers() {
        let tmp = TempDir::new().unwrap();
        let lock = FileLock::new(tmp.path(), "p", Duration::from_millis(20));
        fs::write(lock.lock_path(), "99999").unwrap();
        std::thread::sleep(Duration::from_millis(60));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                std::thread::spawn(move || {
                    let _guard = lock.acquire().unwrap();
                    std::thread::sleep(Duration::from_millis(2));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let left: Vec<_> = fs::read_dir(tmp.path()).unwrap().flatten().collect();
        assert!(left.is_empty(), "{left:?}");
    }

    #[test]
    fn fresh_lock_is_not_broken() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("p.lock");
        fs::write(&path, "1").unwrap();
        assert!(!break_stale(&path, Duration::from_secs(10)));
        assert!(path.exists());
        assert!(!break_stale(&tmp.path().join("missing.lock"), Duration::ZERO));
    }

    #[test]
    fn wait_turn_records_timestamp() {
        let tmp = TempDir::new().unwrap();
        let lock = FileLock::new(tmp.path(), "p", Duration::from_secs(10));
        assert!(lock.last_call_ns().is_none());
        let before = now_ns();
        lock.wait_turn(Duration::from_millis(1)).unwrap();
        assert!(lock.last_call_ns().unwrap() >= before);
    }

    #[test]
    fn sweep_removes_only_old_lock_files() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("old.lock"), "1").unwrap();
        fs::write(tmp.path().join("old.last"), "1").unwrap();
        std::thread::sleep(Duration::from_millis(60));
        fs::write(tmp.path().join("fresh.lock"), "2").unwrap();

        assert_eq!(sweep_stale(tmp.path(), Duration::from_millis(30)), 1);
        assert!(!tmp.path().join("old.lock").exists());
        assert!(tmp.path().join("old.last").exists());
        assert!(tmp.path().join("fresh.lock").exists());
    }

    #[test]
    fn sweep_missing_dir_is_noop() {
        assert_eq!(sweep_stale(Path::new("/nonexistent/dir/x"), Duration::ZERO), 0);
    }
}
