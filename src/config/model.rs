use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::shell::args::{ArgKind, CommandArgs};
use crate::wrapper::{COMMAND_BACKUP, COMMAND_COPY};

#[derive(Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub global: GlobalSection,
    pub profiles: BTreeMap<String, ProfileSection>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub struct GlobalSection {
    #[serde(default)]
    pub initialize: bool,
    #[serde(default)]
    pub restic_binary: Option<String>,
    #[serde(default)]
    pub restic_stale_lock_age: Option<String>,
    #[serde(default)]
    pub restic_lock_retry_after: Option<String>,
    #[serde(default)]
    pub nice: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProfileSection {
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(default)]
    pub lock: Option<String>,
    #[serde(default)]
    pub force_inactive_lock: bool,
    #[serde(default)]
    pub initialize: bool,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub run_before: Vec<String>,
    #[serde(default)]
    pub run_after: Vec<String>,
    #[serde(default)]
    pub run_after_fail: Vec<String>,
    #[serde(default)]
    pub run_finally: Vec<String>,
    #[serde(default)]
    pub backup: Option<BackupSection>,
    #[serde(default)]
    pub retention: Option<RetentionSection>,
    #[serde(default)]
    pub copy: Option<CopySection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BackupSection {
    #[serde(default)]
    pub source: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub tag: Vec<String>,
    #[serde(default)]
    pub check_before: bool,
    #[serde(default)]
    pub check_after: bool,
    #[serde(default)]
    pub no_error_on_warning: bool,
    #[serde(default)]
    pub use_stdin: bool,
    #[serde(default)]
    pub extended_status: bool,
    #[serde(default)]
    pub run_before: Vec<String>,
    #[serde(default)]
    pub run_after: Vec<String>,
    #[serde(default)]
    pub run_finally: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetentionSection {
    #[serde(default)]
    pub before_backup: bool,
    #[serde(default)]
    pub after_backup: bool,
    #[serde(default)]
    pub keep_last: Option<u32>,
    #[serde(default)]
    pub keep_daily: Option<u32>,
    #[serde(default)]
    pub keep_weekly: Option<u32>,
    #[serde(default)]
    pub keep_monthly: Option<u32>,
    #[serde(default)]
    pub prune: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CopySection {
    #[serde(default)]
    pub initialize: bool,
    #[serde(default)]
    pub repository: Option<String>,
}

/// Validated global settings. A zero duration disables the feature.
#[derive(Debug, Clone)]
pub struct Global {
    pub initialize: bool,
    pub restic_binary: String,
    pub restic_stale_lock_age: Duration,
    pub restic_lock_retry_after: Duration,
    pub nice: Option<i32>,
}

impl Default for Global {
    fn default() -> Self {
        Global {
            initialize: false,
            restic_binary: "restic".to_string(),
            restic_stale_lock_age: Duration::from_secs(2 * 3600),
            restic_lock_retry_after: Duration::from_secs(60),
            nice: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub source: Vec<String>,
    pub exclude: Vec<String>,
    pub tag: Vec<String>,
    pub check_before: bool,
    pub check_after: bool,
    pub no_error_on_warning: bool,
    pub use_stdin: bool,
    pub extended_status: bool,
    pub run_before: Vec<String>,
    pub run_after: Vec<String>,
    pub run_finally: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RetentionOptions {
    pub before_backup: bool,
    pub after_backup: bool,
    pub keep_last: Option<u32>,
    pub keep_daily: Option<u32>,
    pub keep_weekly: Option<u32>,
    pub keep_monthly: Option<u32>,
    pub prune: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub initialize: bool,
    pub repository: String,
}

/// A named, validated profile. Immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub repository: String,
    pub lock: Option<PathBuf>,
    pub force_lock: bool,
    pub initialize: bool,
    pub environment: BTreeMap<String, String>,
    pub run_before: Vec<String>,
    pub run_after: Vec<String>,
    pub run_after_fail: Vec<String>,
    pub run_finally: Vec<String>,
    pub backup: Option<BackupOptions>,
    pub retention: Option<RetentionOptions>,
    pub copy: Option<CopyOptions>,
}

impl Profile {
    /// The source paths appended to the backup command line.
    pub fn backup_source(&self) -> Vec<String> {
        self.backup
            .as_ref()
            .map(|b| b.source.clone())
            .unwrap_or_default()
    }

    /// Flags for one engine command, in a fresh builder the wrapper can
    /// clone and extend per invocation.
    pub fn command_flags(&self, command: &str) -> CommandArgs {
        let mut args = CommandArgs::new();
        if !self.repository.is_empty() {
            args.add_flag("--repo", self.repository.clone());
        }
        match command {
            COMMAND_BACKUP => {
                if let Some(backup) = &self.backup {
                    for exclude in &backup.exclude {
                        args.add_arg("--exclude", ArgKind::Plain);
                        args.add_arg(exclude.clone(), ArgKind::CommandLineEscape);
                    }
                    for tag in &backup.tag {
                        args.add_arg("--tag", ArgKind::Plain);
                        args.add_arg(tag.clone(), ArgKind::CommandLineEscape);
                    }
                    if backup.use_stdin {
                        args.add_arg("--stdin", ArgKind::Plain);
                    }
                    if backup.extended_status {
                        args.add_arg("--json", ArgKind::Plain);
                    }
                }
            }
            COMMAND_COPY => {
                if let Some(copy) = &self.copy {
                    if !copy.repository.is_empty() {
                        args.add_flag("--repo2", copy.repository.clone());
                    }
                }
            }
            _ => {}
        }
        args
    }

    /// Flags for the retention pass (the engine's `forget` command).
    pub fn retention_flags(&self) -> CommandArgs {
        let mut args = CommandArgs::new();
        if !self.repository.is_empty() {
            args.add_flag("--repo", self.repository.clone());
        }
        if let Some(retention) = &self.retention {
            if let Some(n) = retention.keep_last {
                args.add_flag("--keep-last", n.to_string());
            }
            if let Some(n) = retention.keep_daily {
                args.add_flag("--keep-daily", n.to_string());
            }
            if let Some(n) = retention.keep_weekly {
                args.add_flag("--keep-weekly", n.to_string());
            }
            if let Some(n) = retention.keep_monthly {
                args.add_flag("--keep-monthly", n.to_string());
            }
            if retention.prune {
                args.add_arg("--prune", ArgKind::Plain);
            }
        }
        args
    }
}

/// Everything a run needs from the configuration file.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub global: Global,
    pub profiles: BTreeMap<String, Profile>,
}
