use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::CommandFailure;
use crate::lock::log_lock_wait;
use crate::progress::Summary;
use crate::shell::analysis::OutputAnalysis;
use crate::util::duration::format_duration;
use crate::wrapper::{
    ResticWrapper, COMMAND_BACKUP, MAX_LOCK_RETRY_TIME, MIN_LOCK_RETRY_TIME, MIN_STALE_LOCK_AGE,
};

impl ResticWrapper {
    /// Returns true when a failed invocation still counts as success:
    /// a backup that could not read some source files (exit code 3)
    /// while `no-error-on-warning` is set.
    pub(crate) fn can_succeed_after_error(&self, command: &str, failure: &CommandFailure) -> bool {
        if command != COMMAND_BACKUP {
            return false;
        }
        let ignore_warning = self
            .profile
            .backup
            .as_ref()
            .map(|b| b.no_error_on_warning)
            .unwrap_or(false);
        if !ignore_warning {
            return false;
        }
        if let CommandFailure::Exit(3) = failure {
            warn!(
                "profile '{}': finished '{}' with warning: failed to read all source data during backup",
                self.profile.name, command
            );
            return true;
        }
        false
    }

    /// Returns true when a failed invocation should be retried. Sleeps
    /// for the computed delay before returning when one applies.
    pub(crate) fn can_retry_after_error(&mut self, command: &str, summary: &Summary) -> bool {
        let output = summary.output_analysis.clone();
        if !output.contains_remote_lock_failure() {
            return false;
        }
        debug!("repository lock failed when running '{}'", command);
        let (retry, sleep) = self.can_retry_after_remote_lock_failure(&output);
        if retry && sleep > Duration::ZERO {
            thread::sleep(sleep);
        }
        retry
    }

    pub(crate) fn can_retry_after_remote_lock_failure(
        &mut self,
        output: &OutputAnalysis,
    ) -> (bool, Duration) {
        if !output.contains_remote_lock_failure() {
            return (false, Duration::ZERO);
        }

        // stale-lock branch
        let mut stale_lock = false;
        let mut stale_condition = String::new();
        if let Some(lock_age) = output.remote_locked_since() {
            let required_age = self.global.restic_stale_lock_age.max(MIN_STALE_LOCK_AGE);
            stale_lock = lock_age >= required_age;
            stale_condition = format!(
                "lock age {} >= {}",
                format_duration(lock_age),
                format_duration(required_age)
            );
        }

        if stale_lock && self.global.restic_stale_lock_age > Duration::ZERO {
            let stale_condition =
                format!("restic: possible stale lock detected ({})", stale_condition);

            // loop protection for stale unlock attempts
            if self.done_try_unlock {
                info!(
                    "{}. Unlock already attempted, will not try again.",
                    stale_condition
                );
                return (false, Duration::ZERO);
            }
            self.done_try_unlock = true;

            if !self.profile.force_lock {
                info!(
                    "{}. Set `force-inactive-lock` to `true` to enable automatic unlocking of stale locks.",
                    stale_condition
                );
                return (false, Duration::ZERO);
            }

            info!("{}. Trying to unlock.", stale_condition);
            if let Err(err) = self.run_unlock() {
                error!("failed removing stale lock. Cause: {}", err);
                return (false, Duration::ZERO);
            }
            return (true, Duration::ZERO);
        }

        // wait-and-retry branch: is there time left for a non-stale lock?
        let mut retry_delay = self.global.restic_lock_retry_after;
        if let Some(lock_wait) = self.lock_wait {
            if retry_delay > Duration::ZERO {
                // execution time is added back: it was not spent waiting
                let elapsed = self.start_time.elapsed();
                let available = (lock_wait + self.execution_time).saturating_sub(elapsed);

                retry_delay = retry_delay.clamp(MIN_LOCK_RETRY_TIME, MAX_LOCK_RETRY_TIME);
                if retry_delay > available {
                    retry_delay = available;
                }

                if retry_delay >= MIN_LOCK_RETRY_TIME {
                    let mut lock_name = self.profile.repository.clone();
                    if let Some(locked_by) = output.remote_locked_by() {
                        lock_name = format!("{} locked by {}", lock_name, locked_by);
                    }
                    log_lock_wait(&lock_name, self.start_time, None, lock_wait);
                    return (true, retry_delay);
                }
                return (false, Duration::ZERO);
            }
        }

        (false, Duration::ZERO)
    }
}
