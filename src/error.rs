use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResticVaultError {
    #[error("{0}")]
    Message(String),
    #[error("{0}")]
    Config(ConfigError),
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Command(CommandError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("parse config: {0}")]
    Parse(String),
    #[error("{0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ResticVaultError>;

impl ResticVaultError {
    pub fn message(msg: impl Into<String>) -> Self {
        ResticVaultError::Message(msg.into())
    }

    /// Returns the command error at the leaf of this error, if any.
    pub fn as_command_error(&self) -> Option<&CommandError> {
        match self {
            ResticVaultError::Command(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for ResticVaultError {
    fn from(err: ConfigError) -> Self {
        ResticVaultError::Config(err)
    }
}

impl From<CommandError> for ResticVaultError {
    fn from(err: CommandError) -> Self {
        ResticVaultError::Command(err)
    }
}

/// Why a subprocess did not complete successfully.
#[derive(Debug, Error)]
pub enum CommandFailure {
    #[error("cannot start process: {0}")]
    Spawn(#[source] io::Error),
    #[error("cannot wait on process: {0}")]
    Wait(#[source] io::Error),
    #[error("exit status {0}")]
    Exit(i32),
    #[error("terminated by signal {0}")]
    Signaled(i32),
}

/// A failed subprocess invocation: context, the non-confidential command
/// line, the captured stderr tail and the underlying cause.
///
/// This is the value surfaced in the `ERROR_*` environment variables
/// handed to failure and finally hooks.
#[derive(Debug, Error)]
#[error("{context}: {cause}")]
pub struct CommandError {
    context: String,
    command_line: String,
    stderr: String,
    cause: CommandFailure,
}

impl CommandError {
    pub fn new(
        context: impl Into<String>,
        command_line: impl Into<String>,
        stderr: impl Into<String>,
        cause: CommandFailure,
    ) -> Self {
        CommandError {
            context: context.into(),
            command_line: command_line.into(),
            stderr: stderr.into(),
            cause,
        }
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    pub fn cause(&self) -> &CommandFailure {
        &self.cause
    }

    /// The child's exit code, when it ran and exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        match self.cause {
            CommandFailure::Exit(code) => Some(code),
            _ => None,
        }
    }
}
