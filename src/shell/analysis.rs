use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::util::duration::parse_duration;

/// How the runner should scan the child's stdout. Stderr is always
/// scanned for repository-lock markers; these modes additionally follow
/// the backup command's stdout, which restic emits as JSON lines when
/// `--json` is active and as plain text otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanMode {
    #[default]
    None,
    BackupJson,
    BackupPlain,
}

/// Signals extracted from the engine's output while it ran.
///
/// Queries are idempotent; the analysis is only mutated by the runner
/// feeding it lines.
#[derive(Debug, Clone, Default)]
pub struct OutputAnalysis {
    remote_lock_failure: bool,
    remote_locked_since: Option<Duration>,
    remote_locked_by: Option<String>,
}

fn locked_by_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)already locked(?:\s+exclusively)?\s+by\s+(.+)").expect("valid pattern")
    })
}

fn locked_since_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)lock was created at .+\(([^)]+) ago\)").expect("valid pattern")
    })
}

impl OutputAnalysis {
    pub fn contains_remote_lock_failure(&self) -> bool {
        self.remote_lock_failure
    }

    /// Age of the remote lock, when the engine reported one.
    pub fn remote_locked_since(&self) -> Option<Duration> {
        self.remote_locked_since
    }

    /// Identification of the remote lock holder, when reported.
    pub fn remote_locked_by(&self) -> Option<&str> {
        self.remote_locked_by.as_deref()
    }

    /// Feeds one line of engine output into the analysis.
    pub fn scan_line(&mut self, line: &str) {
        let lower = line.to_ascii_lowercase();
        if lower.contains("repository is already locked")
            || lower.contains("unable to create lock in backend")
        {
            self.remote_lock_failure = true;
        }
        if self.remote_locked_by.is_none() {
            if let Some(captures) = locked_by_pattern().captures(line) {
                let holder = captures[1].trim().trim_end_matches('.').to_string();
                if !holder.is_empty() {
                    self.remote_locked_by = Some(holder);
                }
            }
        }
        if self.remote_locked_since.is_none() {
            if let Some(captures) = locked_since_pattern().captures(line) {
                if let Ok(age) = parse_duration(captures[1].trim()) {
                    self.remote_locked_since = Some(age);
                }
            }
        }
    }

    /// Feeds one stdout line according to the scan mode. JSON lines are
    /// unwrapped to their message text first; anything that does not
    /// parse is scanned raw.
    pub fn scan_output_line(&mut self, mode: ScanMode, line: &str) {
        match mode {
            ScanMode::None => {}
            ScanMode::BackupPlain => self.scan_line(line),
            ScanMode::BackupJson => match serde_json::from_str::<serde_json::Value>(line) {
                Ok(value) => {
                    for key in ["message", "error", "item"] {
                        if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                            self.scan_line(text);
                        }
                    }
                }
                Err(_) => self.scan_line(line),
            },
        }
    }
}
