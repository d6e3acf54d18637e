//! Bounded supervision of external processes.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
/// How long to keep reading output after the process is gone. Descendants
/// that inherited the pipes can hold them open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// How a supervised process ended.
#[derive(Debug)]
pub enum Exit {
    Finished {
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
    /// The deadline passed; the process group was killed and the child reaped.
    TimedOut { stderr: String },
}

/// A child process with drained output pipes that is killed if dropped
/// before it has been reaped. On unix the child leads its own process group,
/// so killing it also takes down anything it spawned.
pub struct Supervised {
    child: Child,
    stdout: Option<Receiver<Vec<u8>>>,
    stderr: Option<Receiver<Vec<u8>>>,
    reaped: bool,
}

impl Supervised {
    /// Spawns `command` with stdin closed and both output streams captured.
    pub fn spawn(command: &mut Command) -> std::io::Result<Self> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command.spawn()?;
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);
        Ok(Self {
            child,
            stdout,
            stderr,
            reaped: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Blocks until the process exits or `timeout` elapses, whichever comes
    /// first. On timeout the process is killed.
    pub fn wait_timeout(mut self, timeout: Duration) -> std::io::Result<Exit> {
        let deadline = Instant::now().checked_add(timeout).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "timeout out of range")
        })?;
        loop {
            if let Some(status) = self.child.try_wait()? {
                self.reaped = true;
                let drain_until = Instant::now() + DRAIN_GRACE;
                return Ok(Exit::Finished {
                    status,
                    stdout: collect(self.stdout.take(), drain_until),
                    stderr: collect(self.stderr.take(), drain_until),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }

        tracing::warn!(pid = self.child.id(), ?timeout, "process exceeded deadline, killing");
        self.terminate();
        Ok(Exit::TimedOut {
            stderr: collect(self.stderr.take(), Instant::now() + DRAIN_GRACE),
        })
    }

    fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        kill_group(&self.child);
        if let Err(err) = self.child.kill() {
            tracing::debug!(%err, "kill failed");
        }
        if let Err(err) = self.child.wait() {
            tracing::warn!(%err, "failed to reap killed process");
        }
        self.reaped = true;
    }
}

impl Drop for Supervised {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions. The group id is the
    // pid of a child we have not reaped yet, so it cannot have been reused.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        tracing::debug!(err = %std::io::Error::last_os_error(), pgid, "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!(%err, "reading process output failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Gathers output until the writer side closes or `deadline` passes; whatever
/// arrived by then is returned.
fn collect(chunks: Option<Receiver<Vec<u8>>>, deadline: Instant) -> String {
    let mut bytes = Vec::new();
    if let Some(rx) = chunks {
        loop {
            match rx.recv_deadline(deadline) {
                Ok(chunk) => bytes.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::debug!("output pipe still open, keeping partial output");
                    break;
                }
            }
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Runs a short-lived helper and returns its exit status and output.
pub fn run_bounded(command: &mut Command, timeout: Duration) -> std::io::Result<Exit> {
    Supervised::spawn(command)?.wait_timeout(timeout)
}

/// Renders a command line for diagnostics.
pub fn describe(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_output_of_finished_process() {
        let exit = run_bounded(
            Command::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]),
            Duration::from_secs(5),
        )
        .unwrap();

        match exit {
            Exit::Finished {
                status,
                stdout,
                stderr,
            } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stdout.trim(), "out");
                assert_eq!(stderr.trim(), "err");
            }
            Exit::TimedOut { .. } => panic!("should have finished"),
        }
    }

    #[test]
    fn kills_processes_past_deadline() {
        let started = Instant::now();
        let exit = run_bounded(
            Command::new("sh").args(["-c", "exec sleep 30"]),
            Duration::from_millis(200),
        )
        .unwrap();

        assert!(matches!(exit, Exit::TimedOut { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn kills_descendants_holding_the_pipes() {
        // The trailing `true` stops the shell from exec-ing into sleep, so
        // sleep runs as a grandchild that inherits stderr.
        let started = Instant::now();
        let exit = run_bounded(
            Command::new("sh").args(["-c", "echo starting >&2; sleep 30; true"]),
            Duration::from_millis(200),
        )
        .unwrap();

        match exit {
            Exit::TimedOut { stderr } => assert_eq!(stderr.trim(), "starting"),
            Exit::Finished { .. } => panic!("should have timed out"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn background_children_do_not_stall_collection() {
        let started = Instant::now();
        let exit = run_bounded(
            Command::new("sh").args(["-c", "sleep 10 & echo done"]),
            Duration::from_secs(5),
        )
        .unwrap();

        match exit {
            Exit::Finished { status, stdout, .. } => {
                assert!(status.success());
                assert_eq!(stdout.trim(), "done");
            }
            Exit::TimedOut { .. } => panic!("should have finished"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn describes_command_lines() {
        let mut command = Command::new("ffmpeg");
        command.args(["-y", "-t", "4.5"]);
        assert_eq!(describe(&command), "ffmpeg -y -t 4.5");
    }
}
