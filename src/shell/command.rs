use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::CommandFailure;
use crate::progress::Summary;
use crate::shell::analysis::{OutputAnalysis, ScanMode};

/// Stderr is captured for error reporting as a bounded tail only.
pub const STDERR_TAIL_LINES: usize = 64;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Callback publishing the current child PID: `Some(pid)` right after
/// spawn, `None` once the child has exited. Must be safe to call from
/// observation contexts such as signal handlers.
pub type PidReporter = Arc<dyn Fn(Option<u32>) + Send + Sync>;

/// One subprocess invocation: either the engine binary with an argument
/// vector, or an opaque hook command line handed to `sh -c`.
pub struct ShellCommand {
    program: String,
    arguments: Vec<String>,
    public_args: Vec<String>,
    environment: Vec<(String, String)>,
    shell: bool,
    dry_run: bool,
    nice: Option<i32>,
    use_stdin: bool,
    silent: bool,
    scan: ScanMode,
    signals: Receiver<i32>,
    set_pid: Option<PidReporter>,
}

/// What one invocation produced, success or not. The summary and stderr
/// tail are available either way so the caller can account execution
/// time and feed the retry policy.
#[derive(Debug)]
pub struct Execution {
    pub summary: Summary,
    pub stderr: String,
    pub failure: Option<CommandFailure>,
}

impl ShellCommand {
    /// Direct invocation of the engine binary.
    pub fn engine(
        program: impl Into<String>,
        arguments: Vec<String>,
        environment: Vec<(String, String)>,
        dry_run: bool,
        signals: Receiver<i32>,
        set_pid: Option<PidReporter>,
    ) -> Self {
        ShellCommand {
            program: program.into(),
            arguments,
            public_args: Vec::new(),
            environment,
            shell: false,
            dry_run,
            nice: None,
            use_stdin: false,
            silent: false,
            scan: ScanMode::None,
            signals,
            set_pid,
        }
    }

    /// An opaque hook command line, run through a shell.
    pub fn hook(
        command_line: impl Into<String>,
        environment: Vec<(String, String)>,
        dry_run: bool,
        signals: Receiver<i32>,
        set_pid: Option<PidReporter>,
    ) -> Self {
        ShellCommand {
            program: command_line.into(),
            arguments: Vec::new(),
            public_args: Vec::new(),
            environment,
            shell: true,
            dry_run,
            nice: None,
            use_stdin: false,
            silent: false,
            scan: ScanMode::None,
            signals,
            set_pid,
        }
    }

    pub fn set_public_args(&mut self, public_args: Vec<String>) {
        self.public_args = public_args;
    }

    pub fn set_scan(&mut self, scan: ScanMode) {
        self.scan = scan;
    }

    pub fn set_use_stdin(&mut self, use_stdin: bool) {
        self.use_stdin = use_stdin;
    }

    /// Discard the child's output instead of echoing it.
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    pub fn set_nice(&mut self, nice: Option<i32>) {
        self.nice = nice;
    }

    /// The command line with confidential values already redacted,
    /// suitable for logs and the `ERROR_COMMANDLINE` variable.
    pub fn public_line(&self) -> String {
        if self.shell || self.public_args.is_empty() {
            return self.program.clone();
        }
        format!("{} {}", self.program, self.public_args.join(" "))
    }

    /// Runs the child to completion. In dry-run mode the command is
    /// logged and nothing is spawned.
    pub fn run(&self) -> Execution {
        debug!("running: {}", self.public_line());
        if self.dry_run {
            return Execution {
                summary: Summary::default(),
                stderr: String::new(),
                failure: None,
            };
        }

        let start = Instant::now();
        let mut child = match self.build().spawn() {
            Ok(child) => child,
            Err(err) => {
                return Execution {
                    summary: Summary {
                        duration: start.elapsed(),
                        ..Summary::default()
                    },
                    stderr: String::new(),
                    failure: Some(CommandFailure::Spawn(err)),
                }
            }
        };
        if let Some(report) = &self.set_pid {
            report(Some(child.id()));
        }

        let analysis = Arc::new(Mutex::new(OutputAnalysis::default()));
        let stderr_reader = child.stderr.take().map(|pipe| {
            let analysis = Arc::clone(&analysis);
            let silent = self.silent;
            thread::spawn(move || read_stderr(pipe, &analysis, silent))
        });
        let stdout_reader = child.stdout.take().map(|pipe| {
            let analysis = Arc::clone(&analysis);
            let scan = self.scan;
            let silent = self.silent;
            thread::spawn(move || read_stdout(pipe, &analysis, scan, silent))
        });

        let (status, forwarded) = self.wait(&mut child);

        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if let Some(handle) = stdout_reader {
            let _ = handle.join();
        }
        if let Some(report) = &self.set_pid {
            report(None);
        }

        let output_analysis = analysis
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        Execution {
            summary: Summary {
                duration: start.elapsed(),
                output_analysis,
            },
            stderr,
            failure: interpret_status(status, forwarded),
        }
    }

    fn build(&self) -> Command {
        let mut command = if self.shell {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.program);
            c
        } else if let Some(level) = self.nice {
            let mut c = Command::new("nice");
            c.arg("-n")
                .arg(level.to_string())
                .arg(&self.program)
                .args(&self.arguments);
            c
        } else {
            let mut c = Command::new(&self.program);
            c.args(&self.arguments);
            c
        };
        command.envs(self.environment.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        command.stdin(if self.use_stdin {
            Stdio::inherit()
        } else {
            Stdio::null()
        });
        command.stderr(Stdio::piped());
        if self.scan != ScanMode::None || self.silent {
            command.stdout(Stdio::piped());
        } else {
            command.stdout(Stdio::inherit());
        }
        command
    }

    /// Waits for the child, forwarding any signal received on the
    /// channel while it runs.
    fn wait(&self, child: &mut Child) -> (std::io::Result<ExitStatus>, Option<i32>) {
        let mut forwarded = None;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return (Ok(status), forwarded),
                Ok(None) => {}
                Err(err) => return (Err(err), forwarded),
            }
            if let Ok(signal) = self.signals.try_recv() {
                forwarded = Some(signal);
                forward_signal(child.id(), signal);
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

fn forward_signal(pid: u32, signal: i32) {
    let target = Signal::try_from(signal).unwrap_or(Signal::SIGTERM);
    debug!("forwarding {} to pid {}", target, pid);
    if let Err(err) = kill(Pid::from_raw(pid as i32), target) {
        warn!("cannot forward signal to pid {}: {}", pid, err);
    }
}

fn interpret_status(
    status: std::io::Result<ExitStatus>,
    forwarded: Option<i32>,
) -> Option<CommandFailure> {
    use std::os::unix::process::ExitStatusExt;

    let status = match status {
        Ok(status) => status,
        Err(err) => return Some(CommandFailure::Wait(err)),
    };
    if status.success() {
        return None;
    }
    if let Some(signal) = forwarded {
        return Some(CommandFailure::Signaled(signal));
    }
    if let Some(signal) = status.signal() {
        return Some(CommandFailure::Signaled(signal));
    }
    Some(CommandFailure::Exit(status.code().unwrap_or(1)))
}

fn read_stderr(pipe: ChildStderr, analysis: &Mutex<OutputAnalysis>, silent: bool) -> String {
    let reader = BufReader::new(pipe);
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if let Ok(mut analysis) = analysis.lock() {
            analysis.scan_line(&line);
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        if !silent {
            eprintln!("{}", line);
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join("\n")
}

fn read_stdout(pipe: ChildStdout, analysis: &Mutex<OutputAnalysis>, scan: ScanMode, silent: bool) {
    let reader = BufReader::new(pipe);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if scan != ScanMode::None {
            if let Ok(mut analysis) = analysis.lock() {
                analysis.scan_output_line(scan, &line);
            }
        }
        if !silent {
            println!("{}", line);
        }
    }
}
