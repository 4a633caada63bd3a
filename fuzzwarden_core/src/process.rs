//! Spawning and supervising engine processes.
//!
//! A supervised run uses three helper threads: one pump per output stream
//! and a supervisor that polls the child for exit and watches the
//! [`CancelToken`]. All of them feed one channel which the calling thread
//! drains, so lines reach the caller in the order they were read and the
//! pumps never wait on the caller.

use crate::cancel::CancelToken;
use crate::envutil::{EnvOverlay, quoted_command_with_env};
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Sender};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time a cancelled process group gets between SIGTERM and SIGKILL.
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Number of trailing stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("No command to execute")]
    EmptyCommand,
    #[error("Failed to start {command}: {source}")]
    Spawn { command: String, source: io::Error },
    #[error("Failed to wait for {command}: {source}")]
    Wait { command: String, source: io::Error },
}

/// Which pipe a line came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(line) | OutputLine::Stderr(line) => line,
        }
    }
}

/// A fully assembled command: argv, environment overlay, working dir.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub args: Vec<String>,
    pub env: EnvOverlay,
    pub working_dir: Option<PathBuf>,
    pub termination_grace: Duration,
}

impl ProcessCommand {
    pub fn new(args: Vec<String>, env: EnvOverlay) -> Self {
        Self {
            args,
            env,
            working_dir: None,
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }

    /// Shell-style rendering, used in logs and error messages.
    pub fn command_line(&self) -> String {
        quoted_command_with_env(&self.args, &self.env)
    }

    fn build(&self) -> Result<Command, ProcessError> {
        let (program, rest) = self.args.split_first().ok_or(ProcessError::EmptyCommand)?;
        let mut cmd = Command::new(program);
        cmd.args(rest)
            .env_clear()
            .envs(self.env.apply_to_current())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // own process group, so the whole tree can be signalled at once
            .process_group(0);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }
}

/// How a supervised process ended.
#[derive(Debug)]
pub struct ProcessExit {
    pub status: ExitStatus,
    /// The process was stopped because the token was cancelled.
    pub cancelled: bool,
    pub stderr_tail: Vec<String>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.status.success() && !self.cancelled
    }
}

enum Event {
    Line(OutputLine),
    Exited(io::Result<ExitStatus>, bool),
}

/// Runs `command` to completion, handing every output line to `on_line`
/// on the calling thread.
///
/// When `cancel` fires, the process group receives SIGTERM, then SIGKILL
/// after the grace period. The returned [`ProcessExit`] is marked
/// cancelled in that case regardless of the exit status.
pub fn supervise<F>(
    command: &ProcessCommand,
    cancel: &CancelToken,
    mut on_line: F,
) -> Result<ProcessExit, ProcessError>
where
    F: FnMut(&OutputLine),
{
    let command_line = command.command_line();
    debug!("Command: {}", command_line);

    let mut child = command
        .build()?
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: command_line.clone(),
            source,
        })?;

    let (tx, rx) = mpsc::channel::<Event>();

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut pumps = Vec::new();
    if let Some(stdout) = stdout {
        pumps.push(spawn_pump(stdout, tx.clone(), OutputLine::Stdout));
    }
    if let Some(stderr) = stderr {
        pumps.push(spawn_pump(stderr, tx.clone(), OutputLine::Stderr));
    }

    let grace = command.termination_grace;
    let watch = cancel.clone();
    let supervisor = thread::spawn(move || {
        let (result, cancelled) = wait_or_cancel(&mut child, &watch, grace);
        let _ = tx.send(Event::Exited(result, cancelled));
    });

    let mut exit = None;
    let mut stderr_tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    // The channel closes once the supervisor and both pumps are done.
    for event in rx {
        match event {
            Event::Line(line) => {
                if let OutputLine::Stderr(text) = &line {
                    if stderr_tail.len() == STDERR_TAIL_LINES {
                        stderr_tail.pop_front();
                    }
                    stderr_tail.push_back(text.clone());
                }
                on_line(&line);
            }
            Event::Exited(result, cancelled) => exit = Some((result, cancelled)),
        }
    }

    for pump in pumps {
        let _ = pump.join();
    }
    let _ = supervisor.join();

    let (result, cancelled) = exit.unwrap_or_else(|| {
        (
            Err(io::Error::other("supervisor exited without a status")),
            cancel.is_cancelled(),
        )
    });
    let status = result.map_err(|source| ProcessError::Wait {
        command: command_line,
        source,
    })?;

    Ok(ProcessExit {
        status,
        cancelled: cancelled || cancel.is_cancelled(),
        stderr_tail: stderr_tail.into(),
    })
}

fn spawn_pump<R, F>(stream: R, tx: Sender<Event>, wrap: F) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
    F: Fn(String) -> OutputLine + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let text = text.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send(Event::Line(wrap(text))).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to read process output: {}", e);
                    break;
                }
            }
        }
    })
}

fn wait_or_cancel(
    child: &mut Child,
    cancel: &CancelToken,
    grace: Duration,
) -> (io::Result<ExitStatus>, bool) {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                // Helpers left behind by the target would keep the pipes
                // open and stall the pumps.
                kill_group(child.id(), libc::SIGKILL);
                return (Ok(status), cancel.is_cancelled());
            }
            Ok(None) if cancel.is_cancelled() => {
                return (terminate_process_group(child, grace), true);
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return (Err(e), cancel.is_cancelled()),
        }
    }
}

/// Sends SIGTERM to the child's process group, waits up to `grace` for
/// the child to exit and escalates to SIGKILL otherwise.
pub fn terminate_process_group(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let pgid = child.id();
    debug!("Sending SIGTERM to process group {}", pgid);
    kill_group(pgid, libc::SIGTERM);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            kill_group(pgid, libc::SIGKILL);
            return Ok(status);
        }
        thread::sleep(POLL_INTERVAL);
    }

    warn!(
        "Process group {} still running after {:?}, sending SIGKILL",
        pgid, grace
    );
    kill_group(pgid, libc::SIGKILL);
    child.wait()
}

fn kill_group(pgid: u32, signal: libc::c_int) {
    // SAFETY: kill(2) accepts any pid and signal. A group that no longer
    // exists yields ESRCH, which is ignored.
    unsafe {
        libc::kill(-(pgid as libc::pid_t), signal);
    }
}
