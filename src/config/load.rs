use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::model::{
    BackupOptions, ConfigFile, CopyOptions, Global, Profile, ProfileSection, RetentionOptions,
    RuntimeConfig,
};
use crate::error::{ConfigError, Result, ResticVaultError};
use crate::util::duration::parse_duration;

pub fn is_safe_name(name: &str) -> bool {
    if name.is_empty() || name == "." || name == ".." {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

pub fn load_config(path: &Path) -> Result<RuntimeConfig> {
    let mut contents = String::new();
    File::open(path)
        .map_err(ResticVaultError::Io)?
        .read_to_string(&mut contents)
        .map_err(ResticVaultError::Io)?;
    let cfg: ConfigFile =
        serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
    parse_runtime(cfg)
}

fn parse_runtime(cfg: ConfigFile) -> Result<RuntimeConfig> {
    let defaults = Global::default();
    let global = Global {
        initialize: cfg.global.initialize,
        restic_binary: cfg
            .global
            .restic_binary
            .unwrap_or(defaults.restic_binary),
        restic_stale_lock_age: parse_config_duration(
            cfg.global.restic_stale_lock_age.as_deref(),
            "restic-stale-lock-age",
            defaults.restic_stale_lock_age,
        )?,
        restic_lock_retry_after: parse_config_duration(
            cfg.global.restic_lock_retry_after.as_deref(),
            "restic-lock-retry-after",
            defaults.restic_lock_retry_after,
        )?,
        nice: cfg.global.nice,
    };

    let mut profiles = std::collections::BTreeMap::new();
    for (name, section) in cfg.profiles {
        if !is_safe_name(&name) {
            return Err(ConfigError::Invalid(format!(
                "profile {} name must use only letters, digits, '.', '-', '_'",
                name
            ))
            .into());
        }
        let profile = parse_profile(&name, section)?;
        profiles.insert(name, profile);
    }

    Ok(RuntimeConfig { global, profiles })
}

fn parse_profile(name: &str, section: ProfileSection) -> Result<Profile> {
    let backup = section.backup.map(|b| BackupOptions {
        source: b.source,
        exclude: b.exclude,
        tag: b.tag,
        check_before: b.check_before,
        check_after: b.check_after,
        no_error_on_warning: b.no_error_on_warning,
        use_stdin: b.use_stdin,
        extended_status: b.extended_status,
        run_before: b.run_before,
        run_after: b.run_after,
        run_finally: b.run_finally,
    });
    if let Some(backup) = &backup {
        if backup.use_stdin && !backup.source.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "profile {}: use-stdin and source paths are mutually exclusive",
                name
            ))
            .into());
        }
    }
    let retention = section.retention.map(|r| RetentionOptions {
        before_backup: r.before_backup,
        after_backup: r.after_backup,
        keep_last: r.keep_last,
        keep_daily: r.keep_daily,
        keep_weekly: r.keep_weekly,
        keep_monthly: r.keep_monthly,
        prune: r.prune,
    });
    let copy = section.copy.map(|c| CopyOptions {
        initialize: c.initialize,
        repository: c.repository.unwrap_or_default(),
    });
    let lock = section
        .lock
        .filter(|l| !l.trim().is_empty())
        .map(PathBuf::from);

    Ok(Profile {
        name: name.to_string(),
        repository: section.repository.unwrap_or_default(),
        lock,
        force_lock: section.force_inactive_lock,
        initialize: section.initialize,
        environment: section.environment,
        run_before: section.run_before,
        run_after: section.run_after,
        run_after_fail: section.run_after_fail,
        run_finally: section.run_finally,
        backup,
        retention,
        copy,
    })
}

fn parse_config_duration(
    value: Option<&str>,
    field: &str,
    default: Duration,
) -> Result<Duration> {
    match value {
        None => Ok(default),
        Some(text) => parse_duration(text)
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", field, e)).into()),
    }
}

pub fn resolve_profile(cfg: &RuntimeConfig, name: &str) -> Result<Profile> {
    cfg.profiles
        .get(name)
        .cloned()
        .ok_or_else(|| ResticVaultError::message(format!("profile '{}' not found", name)))
}
