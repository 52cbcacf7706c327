//! Runs one external plugin command under a timeout.
//!
//! The child is placed in its own process group so that a shell wrapper and
//! everything it started are signalled together: SIGTERM once `timeout`
//! elapses, SIGKILL if the group is still alive `kill_after` later.

use std::io::{self, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use thiserror::Error;

pub const DEFAULT_KILL_AFTER: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

type Reader = Option<JoinHandle<Vec<u8>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub args: Vec<String>,
    pub timeout: Duration,
    pub kill_after: Duration,
}

impl Command {
    pub fn new(args: Vec<String>, timeout: Duration) -> Self {
        Self {
            args,
            timeout,
            kill_after: DEFAULT_KILL_AFTER,
        }
    }

    pub fn with_kill_after(mut self, kill_after: Duration) -> Self {
        self.kill_after = kill_after;
        self
    }
}

/// How a command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    /// Terminated by a signal the runner did not send.
    Signaled(i32),
    /// Exceeded its timeout and exited after SIGTERM.
    TimedOut,
    /// Ignored SIGTERM and was killed after the grace period.
    Killed,
}

impl ExitState {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, ExitState::TimedOut | ExitState::Killed)
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub state: ExitState,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("command execute failed: {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("failed to wait for {program}: {source}")]
    Wait { program: String, source: io::Error },
}

/// Runs `command` to completion, logging its stderr under `id`.
pub fn run(id: &str, command: &Command) -> Result<CommandOutput, CommandError> {
    let (program, args) = command.args.split_first().ok_or(CommandError::Empty)?;
    debug!("[{}] exec {:?}", id, command.args);

    let mut child = std::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = capture(child.stdout.take());
    let stderr = capture(child.stderr.take());

    let state = supervise(&mut child, command, [&stdout, &stderr]).map_err(|source| CommandError::Wait {
        program: program.clone(),
        source,
    })?;

    let output = CommandOutput {
        state,
        stdout: collect(stdout),
        stderr: collect(stderr),
    };
    if !output.stderr.is_empty() {
        warn!(
            "[{}] {}",
            id,
            String::from_utf8_lossy(&output.stderr).trim_end()
        );
    }
    Ok(output)
}

/// Waits for the child and for its output pipes to close. Anything still
/// running at the deadline, including descendants holding the pipes, gets
/// SIGTERM and then SIGKILL after `kill_after`.
fn supervise(child: &mut Child, command: &Command, readers: [&Reader; 2]) -> io::Result<ExitState> {
    let deadline = Instant::now() + command.timeout;
    let exited = wait_until(child, deadline)?;
    if let Some(status) = exited {
        if wait_for_readers(readers, deadline) {
            return Ok(exit_state(status));
        }
        debug!("output still open after exit, terminating process group");
    }
    signal_group(child, libc::SIGTERM);
    let grace = Instant::now() + command.kill_after;
    let exited = match exited {
        Some(status) => Some(status),
        None => wait_until(child, grace)?,
    };
    if exited.is_some() && wait_for_readers(readers, grace) {
        return Ok(ExitState::TimedOut);
    }
    signal_group(child, libc::SIGKILL);
    if exited.is_none() {
        child.wait()?;
    }
    Ok(ExitState::Killed)
}

fn wait_for_readers(readers: [&Reader; 2], deadline: Instant) -> bool {
    loop {
        if readers.iter().all(|r| r.as_ref().map_or(true, JoinHandle::is_finished)) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

fn exit_state(status: ExitStatus) -> ExitState {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitState::Exited(code),
        (None, Some(signal)) => ExitState::Signaled(signal),
        (None, None) => ExitState::Exited(-1),
    }
}

fn signal_group(child: &Child, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid only signals the group we created.
    unsafe {
        libc::kill(-pgid, signal);
    }
}

fn capture<R: Read + Send + 'static>(pipe: Option<R>) -> Reader {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Reader) -> Vec<u8> {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> Command {
        Command::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout,
        )
        .with_kill_after(Duration::from_millis(500))
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let out = run("test", &sh("echo hello; exit 3", Duration::from_secs(5))).unwrap();
        assert_eq!(out.state, ExitState::Exited(3));
        assert_eq!(out.stdout, b"hello\n");
    }

    #[test]
    fn captures_stderr() {
        let out = run("test", &sh("echo oops >&2", Duration::from_secs(5))).unwrap();
        assert_eq!(out.state, ExitState::Exited(0));
        assert_eq!(out.stderr, b"oops\n");
        assert!(out.stdout.is_empty());
    }

    #[test]
    fn terminates_after_timeout() {
        let started = Instant::now();
        let out = run("test", &sh("sleep 10", Duration::from_millis(200))).unwrap();
        assert_eq!(out.state, ExitState::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn kills_when_sigterm_is_ignored() {
        let cmd = sh("trap '' TERM; sleep 10", Duration::from_millis(200));
        let started = Instant::now();
        let out = run("test", &cmd).unwrap();
        assert_eq!(out.state, ExitState::Killed);
        assert!(out.state.is_timed_out());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn background_child_holding_output_is_bounded_by_timeout() {
        let cmd = sh("sleep 30 & echo hi", Duration::from_secs(1));
        let started = Instant::now();
        let out = run("test", &cmd).unwrap();
        assert!(out.state.is_timed_out(), "state {:?}", out.state);
        assert_eq!(out.stdout, b"hi\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn short_lived_background_child_keeps_exit_code() {
        let out = run("test", &sh("sleep 0.2 & echo hi", Duration::from_secs(5))).unwrap();
        assert_eq!(out.state, ExitState::Exited(0));
        assert_eq!(out.stdout, b"hi\n");
    }

    #[test]
    fn reports_spawn_failure() {
        let cmd = Command::new(
            vec!["/nonexistent/plugin-binary".to_string()],
            Duration::from_secs(1),
        );
        match run("test", &cmd) {
            Err(CommandError::Spawn { program, .. }) => {
                assert_eq!(program, "/nonexistent/plugin-binary")
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn rejects_empty_command() {
        let cmd = Command::new(Vec::new(), Duration::from_secs(1));
        assert!(matches!(run("test", &cmd), Err(CommandError::Empty)));
    }

    #[test]
    fn reports_foreign_signal() {
        let out = run("test", &sh("kill -9 $$", Duration::from_secs(5))).unwrap();
        assert_eq!(out.state, ExitState::Signaled(9));
    }
}
