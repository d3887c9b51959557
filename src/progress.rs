use std::time::Duration;

use tracing::{info, warn};

use crate::error::CommandFailure;
use crate::shell::analysis::OutputAnalysis;
use crate::util::duration::format_duration;

/// Per-invocation record handed to progress receivers: how long the
/// engine ran and what its output revealed.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub duration: Duration,
    pub output_analysis: OutputAnalysis,
}

/// Receives one summary per engine invocation (hooks and dry-runs are
/// not reported). Called synchronously from the orchestrating task, so
/// implementations must be cheap or dispatch their own work.
pub trait Receiver {
    fn summary(&self, command: &str, summary: &Summary, stderr: &str, result: Option<&CommandFailure>);
}

/// Default receiver: one log line per invocation.
pub struct LogReceiver;

impl Receiver for LogReceiver {
    fn summary(
        &self,
        command: &str,
        summary: &Summary,
        _stderr: &str,
        result: Option<&CommandFailure>,
    ) {
        match result {
            None => info!(
                "'{}' finished in {}",
                command,
                format_duration(summary.duration)
            ),
            Some(failure) => warn!(
                "'{}' failed after {}: {}",
                command,
                format_duration(summary.duration),
                failure
            ),
        }
    }
}
