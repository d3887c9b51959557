use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{info, warn};

use crate::error::{ResticVaultError, Result};
use crate::shell::command::PidReporter;
use crate::util::duration::format_duration;

pub const LOG_LOCK_WAIT_EVERY: Duration = Duration::from_secs(5 * 60);

const LOCK_SLEEP: Duration = Duration::from_secs(3);

/// Advisory per-profile lock. The file's first line identifies the
/// holder (`<pid> <program> on <host> since <time>`); existence denotes
/// ownership. A second line records the current child PID when set.
pub struct RunLock {
    path: PathBuf,
    identity: String,
}

impl RunLock {
    pub fn new(path: &Path) -> Self {
        RunLock {
            path: path.to_path_buf(),
            identity: owner_identity(),
        }
    }

    /// Attempts to take the lock. A holder whose process is gone is
    /// treated as stale and replaced.
    pub fn try_acquire(&self) -> bool {
        for _ in 0..3 {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
            {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", self.identity);
                    return true;
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    let pid = match fs::read_to_string(&self.path) {
                        Ok(text) => holder_pid(&text),
                        Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                        Err(_) => return false,
                    };
                    if let Some(pid) = pid {
                        if process_is_alive(pid) {
                            return false;
                        }
                    }
                    match fs::remove_file(&self.path) {
                        Ok(()) => continue,
                        Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                        Err(_) => return false,
                    }
                }
                Err(_) => return false,
            }
        }
        false
    }

    /// Takes the lock regardless of the current holder.
    pub fn force_acquire(&self) -> bool {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(_) => return false,
        }
        self.try_acquire()
    }

    /// Identification of the current holder. Returns a not-found error
    /// when nobody holds the lock.
    pub fn who(&self) -> io::Result<String> {
        let content = fs::read_to_string(&self.path)?;
        Ok(content.lines().next().unwrap_or("").trim().to_string())
    }

    /// Records the current child PID in the lock file for introspection,
    /// or clears it when the child has exited.
    pub fn set_pid(&self, pid: Option<u32>) {
        let content = match pid {
            Some(pid) => format!("{}\nchild {}\n", self.identity, pid),
            None => format!("{}\n", self.identity),
        };
        if let Err(err) = fs::write(&self.path, content) {
            warn!("cannot update lockfile {}: {}", self.path.display(), err);
        }
    }

    /// Removes the lock file, but only if this process owns it.
    pub fn release(&self) {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return;
        };
        if holder_pid(&content) == Some(std::process::id()) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn holder_pid(content: &str) -> Option<u32> {
    content
        .split_whitespace()
        .next()
        .and_then(|token| token.parse::<u32>().ok())
}

fn process_is_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

fn owner_identity() -> String {
    let program = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "resticvault".to_string());
    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!(
        "{} {} on {} since {}",
        std::process::id(),
        program,
        hostname,
        Local::now().format("%d-%m-%Y %H:%M")
    )
}

struct ReleaseGuard {
    lock: Arc<RunLock>,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Runs `body` under the profile's filesystem lock.
///
/// With no lock path the body runs unlocked. A missing parent directory
/// is created (0755); if that fails the profile runs without a lockfile.
/// When the lock is held elsewhere the call waits up to `lock_wait`
/// (force acquisition bypasses the wait), then fails naming the holder.
/// The lock is released on every exit path, including panics.
pub fn lock_run<T, F>(
    lock_file: Option<&Path>,
    force: bool,
    lock_wait: Option<Duration>,
    body: F,
) -> Result<T>
where
    F: FnOnce(Option<PidReporter>) -> Result<T>,
{
    let Some(path) = lock_file else {
        return body(None);
    };

    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            let mut builder = fs::DirBuilder::new();
            builder.recursive(true).mode(0o755);
            if let Err(err) = builder.create(dir) {
                warn!("the profile will run without a lockfile: {}", err);
                return body(None);
            }
        }
    }

    let lock = Arc::new(RunLock::new(path));
    let mut success = lock.try_acquire();
    let start = Instant::now();
    let mut locker = String::new();
    let mut last_logged: Option<Instant> = None;
    let mut lock_wait = lock_wait;

    while !success {
        match lock.who() {
            Ok(who) => {
                if locker != who {
                    last_logged = None;
                }
                locker = who;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                locker = "none".to_string();
            }
            Err(err) => {
                return Err(ResticVaultError::message(format!(
                    "another process left the lockfile unreadable: {}",
                    err
                )));
            }
        }

        if force {
            success = lock.force_acquire();
            if lock_wait.is_none() || success {
                warn!(
                    "previous run of the profile started by {} hasn't finished properly",
                    locker
                );
            }
        } else {
            success = lock.try_acquire();
        }

        if !success {
            match lock_wait {
                None => {
                    return Err(ResticVaultError::message(format!(
                        "another process is already running this profile: {}",
                        locker
                    )));
                }
                Some(wait) if start.elapsed() < wait => {
                    let lock_name = format!("{} locked by {}", path.display(), locker);
                    last_logged = log_lock_wait(&lock_name, start, last_logged, wait);
                    thread::sleep(LOCK_SLEEP.min(wait));
                }
                Some(wait) => {
                    warn!(
                        "previous run of the profile hasn't finished after {}",
                        format_duration(wait)
                    );
                    lock_wait = None;
                }
            }
        }
    }

    let _guard = ReleaseGuard {
        lock: Arc::clone(&lock),
    };
    let reporter: PidReporter = {
        let lock = Arc::clone(&lock);
        Arc::new(move |pid| lock.set_pid(pid))
    };
    body(Some(reporter))
}

/// Logs a lock-wait line at most once per five minutes. The holder name
/// is trimmed; elapsed time appears once waiting has itself exceeded the
/// throttle window. Returns the new last-logged instant.
pub(crate) fn log_lock_wait(
    lock_name: &str,
    started: Instant,
    last_logged: Option<Instant>,
    max_wait: Duration,
) -> Option<Instant> {
    let due = match last_logged {
        None => true,
        Some(at) => at.elapsed() > LOG_LOCK_WAIT_EVERY,
    };
    if !due {
        return last_logged;
    }

    let elapsed = Duration::from_secs(started.elapsed().as_secs());
    let remaining = max_wait.saturating_sub(elapsed);
    if elapsed > LOG_LOCK_WAIT_EVERY {
        info!(
            "lock wait (remaining {} / elapsed {}): {}",
            format_duration(remaining),
            format_duration(elapsed),
            lock_name.trim()
        );
    } else {
        info!(
            "lock wait (remaining {}): {}",
            format_duration(remaining),
            lock_name.trim()
        );
    }
    Some(Instant::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_path(dir: &TempDir) -> PathBuf {
        dir.path().join("profile.lock")
    }

    #[test]
    fn acquire_writes_identity_and_release_removes() {
        let dir = TempDir::new().expect("tempdir");
        let lock = RunLock::new(&lock_path(&dir));
        assert!(lock.try_acquire());
        let who = lock.who().expect("who");
        assert!(who.starts_with(&std::process::id().to_string()));
        lock.release();
        assert!(!lock_path(&dir).exists());
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = TempDir::new().expect("tempdir");
        let first = RunLock::new(&lock_path(&dir));
        let second = RunLock::new(&lock_path(&dir));
        assert!(first.try_acquire());
        assert!(!second.try_acquire());
        first.release();
    }

    #[test]
    fn stale_holder_is_replaced() {
        let dir = TempDir::new().expect("tempdir");
        let path = lock_path(&dir);
        fs::write(&path, "4294967294 ghost on nowhere\n").expect("write");
        let lock = RunLock::new(&path);
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn force_acquire_takes_over_a_live_holder() {
        let dir = TempDir::new().expect("tempdir");
        let path = lock_path(&dir);
        fs::write(&path, format!("{} other-process\n", std::process::id())).expect("write");
        let lock = RunLock::new(&path);
        assert!(!lock.try_acquire());
        assert!(lock.force_acquire());
        lock.release();
    }

    #[test]
    fn who_reports_missing_lock() {
        let dir = TempDir::new().expect("tempdir");
        let lock = RunLock::new(&lock_path(&dir));
        let err = lock.who().expect_err("no lock file");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn set_pid_records_and_clears_the_child() {
        let dir = TempDir::new().expect("tempdir");
        let path = lock_path(&dir);
        let lock = RunLock::new(&path);
        assert!(lock.try_acquire());
        lock.set_pid(Some(1234));
        let content = fs::read_to_string(&path).expect("read");
        assert!(content.contains("child 1234"));
        lock.set_pid(None);
        let content = fs::read_to_string(&path).expect("read");
        assert!(!content.contains("child"));
        lock.release();
    }

    #[test]
    fn lock_run_without_path_runs_unlocked() {
        let result = lock_run(None, false, None, |set_pid| {
            assert!(set_pid.is_none());
            Ok(42)
        });
        assert_eq!(result.expect("unlocked run"), 42);
    }

    #[test]
    fn lock_run_creates_parent_directories() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested/locks/profile.lock");
        let result = lock_run(Some(&path), false, None, |set_pid| {
            assert!(set_pid.is_some());
            assert!(path.exists());
            Ok(())
        });
        result.expect("locked run");
        assert!(!path.exists());
    }

    #[test]
    fn lock_run_fails_fast_when_held() {
        let dir = TempDir::new().expect("tempdir");
        let path = lock_path(&dir);
        let holder = RunLock::new(&path);
        assert!(holder.try_acquire());
        let result = lock_run(Some(&path), false, None, |_| Ok(()));
        let err = result.expect_err("lock is held");
        assert!(err
            .to_string()
            .contains("another process is already running this profile"));
        holder.release();
    }

    #[test]
    fn lock_run_gives_up_after_the_wait_budget() {
        let dir = TempDir::new().expect("tempdir");
        let path = lock_path(&dir);
        let holder = RunLock::new(&path);
        assert!(holder.try_acquire());
        let started = Instant::now();
        let result = lock_run(
            Some(&path),
            false,
            Some(Duration::from_millis(200)),
            |_| Ok(()),
        );
        assert!(result.is_err());
        assert!(started.elapsed() >= Duration::from_millis(200));
        holder.release();
    }

    #[test]
    fn lock_run_force_takes_over() {
        let dir = TempDir::new().expect("tempdir");
        let path = lock_path(&dir);
        let holder = RunLock::new(&path);
        assert!(holder.try_acquire());
        let result = lock_run(Some(&path), true, None, |_| Ok("ran"));
        assert_eq!(result.expect("forced run"), "ran");
        assert!(!path.exists());
    }

    #[test]
    fn lock_run_releases_on_body_error() {
        let dir = TempDir::new().expect("tempdir");
        let path = lock_path(&dir);
        let result: Result<()> = lock_run(Some(&path), false, None, |_| {
            Err(ResticVaultError::message("phase failed"))
        });
        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn lock_run_releases_on_panic() {
        let dir = TempDir::new().expect("tempdir");
        let path = lock_path(&dir);
        let outcome = std::panic::catch_unwind(|| {
            let _: Result<()> = lock_run(Some(&path), false, None, |_| panic!("boom"));
        });
        assert!(outcome.is_err());
        assert!(!path.exists());
    }
}
