use std::cell::RefCell;

use crossbeam_channel::Receiver as SignalReceiver;
use tracing::{debug, error};

use crate::error::{CommandError, ResticVaultError, Result};
use crate::shell::command::{PidReporter, ShellCommand};
use crate::wrapper::{ResticWrapper, COMMAND_BACKUP};

impl ResticWrapper {
    /// Environment variables defined in the profile configuration.
    /// Variable names are always exported uppercase.
    pub(crate) fn environment(&self) -> Vec<(String, String)> {
        let mut env = Vec::with_capacity(self.profile.environment.len());
        for (key, value) in &self.profile.environment {
            let key = key.to_uppercase();
            debug!("setting up environment variable '{}'", key);
            env.push((key, value.clone()));
        }
        env
    }

    /// Context variables describing the current profile run.
    pub(crate) fn profile_environment(&self) -> Vec<(String, String)> {
        vec![
            ("PROFILE_NAME".to_string(), self.profile.name.clone()),
            ("PROFILE_COMMAND".to_string(), self.command.clone()),
        ]
    }

    /// Variables describing the failure, for fail and finally hooks.
    pub(crate) fn fail_environment(&self, err: &ResticVaultError) -> Vec<(String, String)> {
        let mut env = vec![("ERROR".to_string(), err.to_string())];
        if let Some(fail) = err.as_command_error() {
            let exit_code = fail.exit_code().unwrap_or(-1);
            env.push((
                "ERROR_COMMANDLINE".to_string(),
                fail.command_line().to_string(),
            ));
            env.push(("ERROR_EXIT_CODE".to_string(), exit_code.to_string()));
            env.push(("ERROR_STDERR".to_string(), fail.stderr().to_string()));
            // Deprecated: the stderr can originate from a hook command,
            // which doesn't need to be restic
            env.push(("RESTIC_STDERR".to_string(), fail.stderr().to_string()));
        }
        env
    }

    fn hook_environment(&self) -> Vec<(String, String)> {
        let mut env = self.environment();
        env.extend(self.profile_environment());
        env
    }

    /// Runs one hook list in declaration order, stopping at the first
    /// error.
    fn run_hooks(
        &self,
        commands: &[String],
        label: &str,
        extra_env: &[(String, String)],
    ) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let mut env = self.hook_environment();
        env.extend(extra_env.iter().cloned());
        let total = commands.len();
        for (index, hook) in commands.iter().enumerate() {
            debug!("starting '{}' command {}/{}", label, index + 1, total);
            let cmd = ShellCommand::hook(
                hook.clone(),
                env.clone(),
                self.dry_run,
                self.signals.clone(),
                self.set_pid.clone(),
            );
            let exec = cmd.run();
            if let Some(failure) = exec.failure {
                return Err(CommandError::new(
                    format!("{} on profile '{}'", label, self.profile.name),
                    hook.clone(),
                    exec.stderr,
                    failure,
                )
                .into());
            }
        }
        Ok(())
    }

    pub(crate) fn run_profile_pre_command(&self) -> Result<()> {
        self.run_hooks(&self.profile.run_before, "run-before", &[])
    }

    pub(crate) fn run_profile_post_command(&self) -> Result<()> {
        self.run_hooks(&self.profile.run_after, "run-after", &[])
    }

    pub(crate) fn run_backup_pre_command(&self) -> Result<()> {
        match &self.profile.backup {
            Some(backup) => self.run_hooks(&backup.run_before, "run-before backup", &[]),
            None => Ok(()),
        }
    }

    pub(crate) fn run_backup_post_command(&self) -> Result<()> {
        match &self.profile.backup {
            Some(backup) => self.run_hooks(&backup.run_after, "run-after backup", &[]),
            None => Ok(()),
        }
    }

    /// Runs the failure hooks. Their own errors are logged, not
    /// returned: the original phase error is what the run reports.
    pub(crate) fn run_profile_post_fail(&self, err: &ResticVaultError) {
        if self.profile.run_after_fail.is_empty() {
            return;
        }
        let fail_env = self.fail_environment(err);
        if let Err(hook_err) =
            self.run_hooks(&self.profile.run_after_fail, "run-after-fail", &fail_env)
        {
            error!(
                "run-after-fail command failed on profile '{}': {}",
                self.profile.name, hook_err
            );
        }
    }

    /// Arms the finally hooks. They run when the returned guard drops,
    /// on every exit path including panics.
    pub(crate) fn finally_hooks(&self) -> FinallyHooks {
        let mut commands = Vec::new();
        if self.command == COMMAND_BACKUP {
            if let Some(backup) = &self.profile.backup {
                commands.extend(backup.run_finally.iter().cloned());
            }
        }
        commands.extend(self.profile.run_finally.iter().cloned());

        FinallyHooks {
            commands,
            env: self.hook_environment(),
            fail_env: RefCell::new(Vec::new()),
            dry_run: self.dry_run,
            signals: self.signals.clone(),
            set_pid: self.set_pid.clone(),
            profile_name: self.profile.name.clone(),
            command: self.command.clone(),
        }
    }
}

/// Scope guard running the combined finally hook list on drop, in
/// reverse declaration order like stacked scope-exit actions. Every
/// hook runs; errors are logged and discarded.
pub(crate) struct FinallyHooks {
    commands: Vec<String>,
    env: Vec<(String, String)>,
    fail_env: RefCell<Vec<(String, String)>>,
    dry_run: bool,
    signals: SignalReceiver<i32>,
    set_pid: Option<PidReporter>,
    profile_name: String,
    command: String,
}

impl FinallyHooks {
    /// Exposes the failure to the hooks' environment. Only called on
    /// the error path; a panic leaves the environment without it.
    pub(crate) fn set_failure(&self, env: Vec<(String, String)>) {
        *self.fail_env.borrow_mut() = env;
    }
}

impl Drop for FinallyHooks {
    fn drop(&mut self) {
        if self.commands.is_empty() {
            return;
        }
        let mut env = self.env.clone();
        env.extend(self.fail_env.borrow().iter().cloned());
        let total = self.commands.len();
        for (index, hook) in self.commands.iter().enumerate().rev() {
            debug!("starting final command {}/{}", index + 1, total);
            let cmd = ShellCommand::hook(
                hook.clone(),
                env.clone(),
                self.dry_run,
                self.signals.clone(),
                self.set_pid.clone(),
            );
            let exec = cmd.run();
            if let Some(failure) = exec.failure {
                error!(
                    "run-finally command {}/{} failed ('{}' on profile '{}'): {}",
                    index + 1,
                    total,
                    self.command,
                    self.profile_name,
                    failure
                );
            }
        }
    }
}
