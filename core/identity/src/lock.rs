use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Advisory PID-file locks for named background jobs (one sync task per
/// channel at a time).
///
/// This is a crash-recovery aid, not mutual exclusion against live
/// concurrent writers: acquisition is not an atomic test-and-set, so a
/// TOCTOU race between `is_locked` and the write is possible. That is
/// acceptable for coordinating a small number of distinct named jobs.
pub struct JobLocks {
    dir: PathBuf,
}

impl JobLocks {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", name))
    }

    /// Whether the named job is currently locked by a live process. A lock
    /// whose owner no longer exists is stale: it is released here and
    /// reported unlocked.
    pub fn is_locked(&self, name: &str) -> bool {
        let path = self.lock_path(name);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return false;
        };
        match raw.trim().parse::<u32>() {
            Ok(pid) if pid_alive(pid) => true,
            Ok(pid) => {
                warn!("Releasing stale lock '{}' held by dead pid {}", name, pid);
                let _ = std::fs::remove_file(&path);
                false
            }
            Err(_) => {
                warn!("Releasing unreadable lock file '{}'", name);
                let _ = std::fs::remove_file(&path);
                false
            }
        }
    }

    /// Take the named lock for this process. Returns `false` when a live
    /// owner already holds it.
    pub fn acquire(&self, name: &str) -> Result<bool> {
        if self.is_locked(name) {
            return Ok(false);
        }
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating lock dir {}", self.dir.display()))?;
        let path = self.lock_path(name);
        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("writing lock file {}", path.display()))?;
        debug!("Acquired lock '{}' (pid {})", name, std::process::id());
        Ok(true)
    }

    /// Drop the named lock. Best-effort; a missing file is not an error.
    pub fn release(&self, name: &str) {
        let path = self.lock_path(name);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to release lock '{}': {}", name, e);
            }
        }
    }
}

/// Zero-signal liveness probe for a process id (Unix only).
fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        // kill -0 checks for existence without delivering a signal
        let status = std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        matches!(status, Ok(s) if s.success())
    }
    #[cfg(not(unix))]
    {
        // No cheap probe available; conservatively assume alive
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let locks = JobLocks::new(dir.path());

        assert!(!locks.is_locked("sync-sms"));
        assert!(locks.acquire("sync-sms").unwrap());
        assert!(locks.is_locked("sync-sms"));
        // Held by a live process, second acquire fails
        assert!(!locks.acquire("sync-sms").unwrap());

        locks.release("sync-sms");
        assert!(!locks.is_locked("sync-sms"));
    }

    #[test]
    fn test_distinct_jobs_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let locks = JobLocks::new(dir.path());

        assert!(locks.acquire("sync-sms").unwrap());
        assert!(locks.acquire("sync-email").unwrap());
        locks.release("sync-sms");
        assert!(locks.is_locked("sync-email"));
    }

    #[test]
    fn test_stale_lock_is_released() {
        let dir = TempDir::new().unwrap();
        let locks = JobLocks::new(dir.path());

        // A pid far beyond pid_max cannot be alive
        std::fs::write(dir.path().join("sync-whatsapp.lock"), "999999999").unwrap();
        assert!(!locks.is_locked("sync-whatsapp"));
        assert!(!dir.path().join("sync-whatsapp.lock").exists());
        assert!(locks.acquire("sync-whatsapp").unwrap());
    }

    #[test]
    fn test_garbage_lock_file_treated_as_stale() {
        let dir = TempDir::new().unwrap();
        let locks = JobLocks::new(dir.path());

        std::fs::write(dir.path().join("sync-email.lock"), "not a pid").unwrap();
        assert!(!locks.is_locked("sync-email"));
        assert!(locks.acquire("sync-email").unwrap());
    }
}
