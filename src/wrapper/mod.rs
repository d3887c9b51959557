use std::io::IsTerminal;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver as SignalReceiver;
use tracing::info;

use crate::config::model::{Global, Profile};
use crate::error::{CommandError, Result};
use crate::lock::lock_run;
use crate::progress::Receiver;
use crate::shell::analysis::ScanMode;
use crate::shell::args::{ArgKind, CommandArgs};
use crate::shell::command::{Execution, PidReporter, ShellCommand};

pub mod hooks;
pub mod retry;

pub const COMMAND_BACKUP: &str = "backup";
pub const COMMAND_CHECK: &str = "check";
pub const COMMAND_COPY: &str = "copy";
pub const COMMAND_FORGET: &str = "forget";
pub const COMMAND_INIT: &str = "init";
pub const COMMAND_UNLOCK: &str = "unlock";

/// Lower bound on the stale-lock threshold, enforced even when the
/// configuration asks for less.
pub const MIN_STALE_LOCK_AGE: Duration = Duration::from_secs(3600);
/// Clamp window for the remote-lock retry delay.
pub const MIN_LOCK_RETRY_TIME: Duration = Duration::from_secs(15);
pub const MAX_LOCK_RETRY_TIME: Duration = Duration::from_secs(30 * 60);

/// Orchestrates one `(profile, command)` run: locking, hook sequencing,
/// conditional initialization, check and retention passes, the main
/// command retry loop, and failure propagation.
pub struct ResticWrapper {
    restic_binary: String,
    dry_run: bool,
    no_lock: bool,
    lock_wait: Option<Duration>,
    profile: Profile,
    global: Global,
    command: String,
    more_args: Vec<String>,
    signals: SignalReceiver<i32>,
    set_pid: Option<PidReporter>,
    progress: Vec<Box<dyn Receiver>>,

    // run-scoped state, reset by run_profile
    start_time: Instant,
    execution_time: Duration,
    done_try_unlock: bool,
}

impl ResticWrapper {
    pub fn new(
        global: Global,
        profile: Profile,
        command: impl Into<String>,
        more_args: Vec<String>,
        signals: SignalReceiver<i32>,
    ) -> Self {
        ResticWrapper {
            restic_binary: global.restic_binary.clone(),
            dry_run: false,
            no_lock: false,
            lock_wait: None,
            profile,
            global,
            command: command.into(),
            more_args,
            signals,
            set_pid: None,
            progress: Vec::new(),
            start_time: Instant::now(),
            execution_time: Duration::ZERO,
            done_try_unlock: false,
        }
    }

    pub fn set_dry_run(&mut self, dry_run: bool) {
        self.dry_run = dry_run;
    }

    /// Ignore the lock defined in the profile.
    pub fn ignore_lock(&mut self) {
        self.no_lock = true;
        self.lock_wait = None;
    }

    /// Wait up to `duration` to acquire the lock defined in the profile.
    pub fn max_wait_on_lock(&mut self, duration: Duration) {
        self.no_lock = false;
        self.lock_wait = if duration > Duration::ZERO {
            Some(duration)
        } else {
            None
        };
    }

    pub fn add_progress(&mut self, receiver: Box<dyn Receiver>) {
        self.progress.push(receiver);
    }

    /// Runs the full choreography for this profile and command.
    pub fn run_profile(&mut self) -> Result<()> {
        let lock_file = if self.no_lock || self.dry_run {
            None
        } else {
            self.profile.lock.clone()
        };
        let force = self.profile.force_lock;
        let lock_wait = self.lock_wait;

        self.start_time = Instant::now();
        self.execution_time = Duration::ZERO;
        self.done_try_unlock = false;

        lock_run(lock_file.as_deref(), force, lock_wait, |set_pid| {
            self.set_pid = set_pid;
            self.locked_run()
        })
    }

    /// The body executed under the profile lock. The finally hooks are
    /// armed first so they run on every exit, panics included.
    fn locked_run(&mut self) -> Result<()> {
        let finally = self.finally_hooks();
        let result = self.run_sequence();
        if let Err(err) = &result {
            self.run_profile_post_fail(err);
            finally.set_failure(self.fail_environment(err));
        }
        result
    }

    fn run_sequence(&mut self) -> Result<()> {
        let command = self.command.clone();

        self.run_profile_pre_command()?;

        // initialization runs after the pre-profile commands
        if (self.global.initialize || self.profile.initialize) && command != COMMAND_INIT {
            // repositories that already exist make init fail; that's fine
            let _ = self.run_initialize();
        }
        if command == COMMAND_COPY {
            let copy_init = self
                .profile
                .copy
                .as_ref()
                .map(|c| c.initialize)
                .unwrap_or(false);
            if self.global.initialize || copy_init {
                let _ = self.run_initialize_copy();
            }
        }

        if command == COMMAND_BACKUP {
            self.run_backup_pre_command()?;
            if self.backup_flag(|b| b.check_before) {
                self.run_check()?;
            }
            if self.retention_flag(|r| r.before_backup) {
                self.run_retention()?;
            }
        }

        self.run_command(&command)?;

        if command == COMMAND_BACKUP {
            if self.retention_flag(|r| r.after_backup) {
                self.run_retention()?;
            }
            if self.backup_flag(|b| b.check_after) {
                self.run_check()?;
            }
            self.run_backup_post_command()?;
        }

        self.run_profile_post_command()?;
        Ok(())
    }

    fn backup_flag(&self, select: impl Fn(&crate::config::model::BackupOptions) -> bool) -> bool {
        self.profile.backup.as_ref().map(select).unwrap_or(false)
    }

    fn retention_flag(
        &self,
        select: impl Fn(&crate::config::model::RetentionOptions) -> bool,
    ) -> bool {
        self.profile.retention.as_ref().map(select).unwrap_or(false)
    }

    /// Builds one engine invocation from the profile flags. The builder
    /// is cloned so retries always start from the pristine flag set.
    fn prepare_command(&self, command: &str, args: &CommandArgs) -> ShellCommand {
        let mut args = args.clone();
        if !self.more_args.is_empty() {
            args.add_args(&self.more_args, ArgKind::CommandLineEscape);
        }
        if command == COMMAND_BACKUP {
            args.add_args(&self.profile.backup_source(), ArgKind::ConfigBackupSource);
        }

        let mut arguments = vec![command.to_string()];
        arguments.extend(args.all());
        let mut public_args = vec![command.to_string()];
        public_args.extend(args.non_confidential().display());

        let mut cmd = ShellCommand::engine(
            self.restic_binary.clone(),
            arguments,
            self.environment(),
            self.dry_run,
            self.signals.clone(),
            self.set_pid.clone(),
        );
        cmd.set_public_args(public_args);
        cmd.set_nice(self.global.nice);
        if command == COMMAND_BACKUP && self.backup_flag(|b| b.use_stdin) {
            cmd.set_use_stdin(true);
        }
        cmd
    }

    fn notify(&self, command: &str, exec: &Execution) {
        if self.dry_run {
            return;
        }
        for receiver in &self.progress {
            receiver.summary(command, &exec.summary, &exec.stderr, exec.failure.as_ref());
        }
    }

    /// Tries to initialize the repository. The caller swallows the
    /// error: init fails when the repository already exists.
    fn run_initialize(&mut self) -> Result<()> {
        info!(
            "profile '{}': initializing repository (if not existing)",
            self.profile.name
        );
        let args = self.profile.command_flags(COMMAND_INIT);
        let mut cmd = self.prepare_command(COMMAND_INIT, &args);
        cmd.set_silent(true);
        let exec = cmd.run();
        if let Some(failure) = exec.failure {
            return Err(CommandError::new(
                format!(
                    "repository initialization on profile '{}'",
                    self.profile.name
                ),
                cmd.public_line(),
                exec.stderr,
                failure,
            )
            .into());
        }
        Ok(())
    }

    /// Tries to initialize the secondary repository used by the copy
    /// command, promoting its flags to primary for the init call.
    fn run_initialize_copy(&mut self) -> Result<()> {
        info!(
            "profile '{}': initializing secondary repository (if not existing)",
            self.profile.name
        );
        let mut args = self.profile.command_flags(COMMAND_COPY);
        args.promote_secondary_to_primary();
        let mut cmd = self.prepare_command(COMMAND_INIT, &args);
        cmd.set_silent(true);
        let exec = cmd.run();
        if let Some(failure) = exec.failure {
            return Err(CommandError::new(
                format!(
                    "repository initialization on profile '{}'",
                    self.profile.name
                ),
                cmd.public_line(),
                exec.stderr,
                failure,
            )
            .into());
        }
        Ok(())
    }

    fn run_check(&mut self) -> Result<()> {
        info!(
            "profile '{}': checking repository consistency",
            self.profile.name
        );
        let args = self.profile.command_flags(COMMAND_CHECK);
        loop {
            let cmd = self.prepare_command(COMMAND_CHECK, &args);
            let exec = cmd.run();
            self.execution_time += exec.summary.duration;
            self.notify(COMMAND_CHECK, &exec);
            match exec.failure {
                None => return Ok(()),
                Some(failure) => {
                    if self.can_retry_after_error(COMMAND_CHECK, &exec.summary) {
                        continue;
                    }
                    return Err(CommandError::new(
                        format!("backup check on profile '{}'", self.profile.name),
                        cmd.public_line(),
                        exec.stderr,
                        failure,
                    )
                    .into());
                }
            }
        }
    }

    fn run_retention(&mut self) -> Result<()> {
        info!(
            "profile '{}': cleaning up repository using retention information",
            self.profile.name
        );
        let args = self.profile.retention_flags();
        loop {
            let cmd = self.prepare_command(COMMAND_FORGET, &args);
            let exec = cmd.run();
            self.execution_time += exec.summary.duration;
            self.notify("retention", &exec);
            match exec.failure {
                None => return Ok(()),
                Some(failure) => {
                    if self.can_retry_after_error(COMMAND_FORGET, &exec.summary) {
                        continue;
                    }
                    return Err(CommandError::new(
                        format!("backup retention on profile '{}'", self.profile.name),
                        cmd.public_line(),
                        exec.stderr,
                        failure,
                    )
                    .into());
                }
            }
        }
    }

    fn run_command(&mut self, command: &str) -> Result<()> {
        info!("profile '{}': starting '{}'", self.profile.name, command);
        let args = self.profile.command_flags(command);
        loop {
            let mut cmd = self.prepare_command(command, &args);

            if command == COMMAND_BACKUP && !self.progress.is_empty() {
                if self.backup_flag(|b| b.extended_status) {
                    cmd.set_scan(ScanMode::BackupJson);
                } else if self.profile.backup.is_some() && !std::io::stdout().is_terminal() {
                    // without a terminal the engine stops printing its
                    // progress display, so scan the plain output instead
                    cmd.set_scan(ScanMode::BackupPlain);
                }
            }

            let exec = cmd.run();
            self.execution_time += exec.summary.duration;
            self.notify(command, &exec);

            if let Some(failure) = exec.failure {
                if !self.can_succeed_after_error(command, &failure) {
                    if self.can_retry_after_error(command, &exec.summary) {
                        continue;
                    }
                    return Err(CommandError::new(
                        format!("{} on profile '{}'", self.command, self.profile.name),
                        cmd.public_line(),
                        exec.stderr,
                        failure,
                    )
                    .into());
                }
            }
            info!("profile '{}': finished '{}'", self.profile.name, command);
            return Ok(());
        }
    }

    /// Removes stale locks from the repository itself.
    pub(crate) fn run_unlock(&mut self) -> Result<()> {
        info!("profile '{}': unlock stale locks", self.profile.name);
        let args = self.profile.command_flags(COMMAND_UNLOCK);
        let cmd = self.prepare_command(COMMAND_UNLOCK, &args);
        let exec = cmd.run();
        self.execution_time += exec.summary.duration;
        self.notify(COMMAND_UNLOCK, &exec);
        match exec.failure {
            None => Ok(()),
            Some(failure) => Err(CommandError::new(
                format!("unlock on profile '{}'", self.profile.name),
                cmd.public_line(),
                exec.stderr,
                failure,
            )
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::config::model::{BackupOptions, CopyOptions, RetentionOptions};
    use crate::error::CommandFailure;
    use crate::lock::RunLock;
    use crate::progress::Summary;
    use crate::signals;

    struct CountingReceiver {
        count: Arc<AtomicUsize>,
    }

    impl Receiver for CountingReceiver {
        fn summary(
            &self,
            _command: &str,
            _summary: &Summary,
            _stderr: &str,
            _result: Option<&CommandFailure>,
        ) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fake_engine(dir: &Path, body: &str) -> String {
        let path = dir.join("engine");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> {}\n{}\n",
            dir.join("invocations").display(),
            body
        );
        fs::write(&path, script).expect("write engine");
        let mut perms = fs::metadata(&path).expect("stat").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod");
        path.to_string_lossy().to_string()
    }

    fn invocations(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join("invocations"))
            .unwrap_or_default()
            .lines()
            .map(|line| line.to_string())
            .collect()
    }

    fn commands_run(dir: &Path) -> Vec<String> {
        invocations(dir)
            .iter()
            .map(|line| line.split_whitespace().next().unwrap_or("").to_string())
            .collect()
    }

    fn log_lines(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join("log"))
            .unwrap_or_default()
            .lines()
            .map(|line| line.to_string())
            .collect()
    }

    fn append_to_log(dir: &Path, text: &str) -> String {
        format!("echo {} >> {}", text, dir.join("log").display())
    }

    fn base_profile() -> Profile {
        Profile {
            name: "web".to_string(),
            repository: "/repo".to_string(),
            lock: None,
            force_lock: false,
            initialize: false,
            environment: BTreeMap::new(),
            run_before: Vec::new(),
            run_after: Vec::new(),
            run_after_fail: Vec::new(),
            run_finally: Vec::new(),
            backup: None,
            retention: None,
            copy: None,
        }
    }

    fn global_with(binary: &str) -> Global {
        Global {
            restic_binary: binary.to_string(),
            ..Global::default()
        }
    }

    fn wrapper_for(global: Global, profile: Profile, command: &str) -> ResticWrapper {
        ResticWrapper::new(global, profile, command, Vec::new(), signals::none())
    }

    #[test]
    fn happy_backup_runs_phases_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let engine = fake_engine(dir.path(), "exit 0");
        let mut profile = base_profile();
        profile.backup = Some(BackupOptions {
            source: vec!["/s".to_string()],
            check_after: true,
            ..BackupOptions::default()
        });
        profile.retention = Some(RetentionOptions {
            after_backup: true,
            keep_last: Some(2),
            ..RetentionOptions::default()
        });

        let count = Arc::new(AtomicUsize::new(0));
        let mut wrapper = wrapper_for(global_with(&engine), profile, COMMAND_BACKUP);
        wrapper.add_progress(Box::new(CountingReceiver {
            count: Arc::clone(&count),
        }));
        wrapper.run_profile().expect("backup run");

        assert_eq!(commands_run(dir.path()), vec!["backup", "forget", "check"]);
        let lines = invocations(dir.path());
        assert!(lines[0].contains("--repo /repo"));
        assert!(lines[0].ends_with("/s"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn pre_hook_failure_skips_engine_and_runs_fail_and_finally_hooks() {
        let dir = TempDir::new().expect("tempdir");
        let engine = fake_engine(dir.path(), "exit 0");
        let mut profile = base_profile();
        profile.run_before = vec!["false".to_string()];
        profile.run_after_fail = vec![append_to_log(dir.path(), "fail")];
        profile.run_finally = vec![append_to_log(dir.path(), "finally")];

        let mut wrapper = wrapper_for(global_with(&engine), profile, COMMAND_BACKUP);
        let err = wrapper.run_profile().expect_err("pre hook fails");
        assert!(err.to_string().contains("run-before on profile 'web'"));
        assert!(commands_run(dir.path()).is_empty());
        assert_eq!(log_lines(dir.path()), vec!["fail", "finally"]);
    }

    #[test]
    fn finally_hooks_run_in_reverse_declaration_order() {
        let dir = TempDir::new().expect("tempdir");
        let engine = fake_engine(dir.path(), "exit 0");
        let mut profile = base_profile();
        profile.backup = Some(BackupOptions {
            source: vec!["/s".to_string()],
            run_finally: vec![
                append_to_log(dir.path(), "backup-finally-1"),
                append_to_log(dir.path(), "backup-finally-2"),
            ],
            ..BackupOptions::default()
        });
        profile.run_finally = vec![append_to_log(dir.path(), "profile-finally")];

        let mut wrapper = wrapper_for(global_with(&engine), profile, COMMAND_BACKUP);
        wrapper.run_profile().expect("backup run");
        assert_eq!(
            log_lines(dir.path()),
            vec!["profile-finally", "backup-finally-2", "backup-finally-1"]
        );
    }

    #[test]
    fn finally_hooks_run_on_panic() {
        let dir = TempDir::new().expect("tempdir");
        let engine = fake_engine(dir.path(), "exit 0");
        let mut profile = base_profile();
        profile.run_finally = vec![append_to_log(dir.path(), "finally")];

        let wrapper = wrapper_for(global_with(&engine), profile, COMMAND_BACKUP);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = wrapper.finally_hooks();
            panic!("main phase blew up");
        }));
        assert!(outcome.is_err());
        assert_eq!(log_lines(dir.path()), vec!["finally"]);
    }

    #[test]
    fn repository_initialize_runs_before_the_main_command() {
        let dir = TempDir::new().expect("tempdir");
        let engine = fake_engine(dir.path(), "exit 0");
        let mut profile = base_profile();
        profile.backup = Some(BackupOptions {
            source: vec!["/s".to_string()],
            ..BackupOptions::default()
        });
        let mut global = global_with(&engine);
        global.initialize = true;

        let mut wrapper = wrapper_for(global, profile, COMMAND_BACKUP);
        wrapper.run_profile().expect("backup run");
        assert_eq!(commands_run(dir.path()), vec!["init", "backup"]);
    }

    #[test]
    fn init_command_skips_the_initialize_pass() {
        let dir = TempDir::new().expect("tempdir");
        let engine = fake_engine(dir.path(), "exit 0");
        let mut global = global_with(&engine);
        global.initialize = true;

        let mut wrapper = wrapper_for(global, base_profile(), COMMAND_INIT);
        wrapper.run_profile().expect("init run");
        assert_eq!(commands_run(dir.path()), vec!["init"]);
    }

    #[test]
    fn copy_initializes_the_secondary_repository_with_promoted_flags() {
        let dir = TempDir::new().expect("tempdir");
        let engine = fake_engine(dir.path(), "exit 0");
        let mut profile = base_profile();
        profile.copy = Some(CopyOptions {
            initialize: true,
            repository: "/secondary".to_string(),
        });

        let mut wrapper = wrapper_for(global_with(&engine), profile, COMMAND_COPY);
        wrapper.run_profile().expect("copy run");

        let lines = invocations(dir.path());
        assert_eq!(commands_run(dir.path()), vec!["init", "copy"]);
        assert!(lines[0].contains("--repo /secondary"));
        assert!(!lines[0].contains("--repo2"));
        assert!(lines[1].contains("--repo /repo"));
        assert!(lines[1].contains("--repo2 /secondary"));
    }

    #[test]
    fn backup_warning_exit_code_counts_as_success() {
        let dir = TempDir::new().expect("tempdir");
        let engine = fake_engine(
            dir.path(),
            "case \"$1\" in backup) exit 3;; esac\nexit 0",
        );
        let mut profile = base_profile();
        profile.backup = Some(BackupOptions {
            source: vec!["/s".to_string()],
            check_after: true,
            no_error_on_warning: true,
            ..BackupOptions::default()
        });

        let mut wrapper = wrapper_for(global_with(&engine), profile, COMMAND_BACKUP);
        wrapper.run_profile().expect("warning is success");
        assert_eq!(commands_run(dir.path()), vec!["backup", "check"]);
    }

    #[test]
    fn stale_remote_lock_unlocks_once_then_retries() {
        let dir = TempDir::new().expect("tempdir");
        let state = dir.path().join("state");
        let body = format!(
            "case \"$1\" in\nbackup)\n  if [ ! -f {state} ]; then\n    touch {state}\n    echo 'Fatal: repository is already locked exclusively by PID 1 on other' 1>&2\n    echo 'lock was created at 2026-01-01 10:00:00 (3h0m0s ago)' 1>&2\n    exit 1\n  fi\n  exit 0\n  ;;\nesac\nexit 0",
            state = state.display()
        );
        let engine = fake_engine(dir.path(), &body);
        let mut profile = base_profile();
        profile.force_lock = true;
        profile.backup = Some(BackupOptions {
            source: vec!["/s".to_string()],
            ..BackupOptions::default()
        });

        let mut wrapper = wrapper_for(global_with(&engine), profile, COMMAND_BACKUP);
        wrapper.run_profile().expect("second attempt succeeds");
        assert_eq!(commands_run(dir.path()), vec!["backup", "unlock", "backup"]);
    }

    #[test]
    fn stale_remote_lock_is_unlocked_at_most_once_per_run() {
        let dir = TempDir::new().expect("tempdir");
        let body = "case \"$1\" in\nbackup)\n  echo 'Fatal: repository is already locked exclusively by PID 1 on other' 1>&2\n  echo 'lock was created at 2026-01-01 10:00:00 (3h0m0s ago)' 1>&2\n  exit 1\n  ;;\nesac\nexit 0";
        let engine = fake_engine(dir.path(), body);
        let mut profile = base_profile();
        profile.force_lock = true;
        profile.backup = Some(BackupOptions {
            source: vec!["/s".to_string()],
            ..BackupOptions::default()
        });

        let mut wrapper = wrapper_for(global_with(&engine), profile, COMMAND_BACKUP);
        let err = wrapper.run_profile().expect_err("lock never clears");
        assert!(err.to_string().contains("backup on profile 'web'"));
        assert_eq!(commands_run(dir.path()), vec!["backup", "unlock", "backup"]);
    }

    #[test]
    fn hooks_see_profile_variables_uppercased() {
        let dir = TempDir::new().expect("tempdir");
        let engine = fake_engine(dir.path(), "exit 0");
        let mut profile = base_profile();
        profile
            .environment
            .insert("my_var".to_string(), "hello".to_string());
        profile.run_before = vec![
            "test \"$PROFILE_NAME\" = web && test \"$PROFILE_COMMAND\" = backup && test \"$MY_VAR\" = hello"
                .to_string(),
        ];

        let mut wrapper = wrapper_for(global_with(&engine), profile, COMMAND_BACKUP);
        wrapper.run_profile().expect("env vars are present");
    }

    #[test]
    fn fail_hooks_see_the_error_details() {
        let dir = TempDir::new().expect("tempdir");
        let engine = fake_engine(dir.path(), "echo boom 1>&2\nexit 5");
        let mut profile = base_profile();
        profile.run_after_fail = vec![format!(
            "echo \"$ERROR_EXIT_CODE:$ERROR_STDERR:$RESTIC_STDERR\" >> {}",
            dir.path().join("log").display()
        )];

        let mut wrapper = wrapper_for(global_with(&engine), profile, COMMAND_BACKUP);
        let err = wrapper.run_profile().expect_err("engine fails");
        assert!(err.to_string().contains("exit status 5"));
        assert_eq!(log_lines(dir.path()), vec!["5:boom:boom"]);
    }

    #[test]
    fn dry_run_spawns_nothing_and_suppresses_progress() {
        let dir = TempDir::new().expect("tempdir");
        let engine = fake_engine(dir.path(), "exit 0");
        let mut profile = base_profile();
        profile.run_before = vec![append_to_log(dir.path(), "pre")];
        profile.backup = Some(BackupOptions {
            source: vec!["/s".to_string()],
            ..BackupOptions::default()
        });

        let count = Arc::new(AtomicUsize::new(0));
        let mut wrapper = wrapper_for(global_with(&engine), profile, COMMAND_BACKUP);
        wrapper.set_dry_run(true);
        wrapper.add_progress(Box::new(CountingReceiver {
            count: Arc::clone(&count),
        }));
        wrapper.run_profile().expect("dry run");

        assert!(invocations(dir.path()).is_empty());
        assert!(log_lines(dir.path()).is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn profile_lock_prevents_a_concurrent_run() {
        let dir = TempDir::new().expect("tempdir");
        let engine = fake_engine(dir.path(), "exit 0");
        let lock_path = dir.path().join("profile.lock");
        let mut profile = base_profile();
        profile.lock = Some(lock_path.clone());
        profile.backup = Some(BackupOptions {
            source: vec!["/s".to_string()],
            ..BackupOptions::default()
        });

        let holder = RunLock::new(&lock_path);
        assert!(holder.try_acquire());
        let mut wrapper = wrapper_for(global_with(&engine), profile.clone(), COMMAND_BACKUP);
        let err = wrapper.run_profile().expect_err("lock is held");
        assert!(err
            .to_string()
            .contains("another process is already running this profile"));
        holder.release();

        let mut wrapper = wrapper_for(global_with(&engine), profile, COMMAND_BACKUP);
        wrapper.run_profile().expect("lock is free again");
        assert!(!lock_path.exists());
    }
}
