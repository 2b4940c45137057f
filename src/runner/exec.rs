use anyhow::{Context, Result};
use std::io::{self, Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long to wait for output pipes to close after a timed-out test is killed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

pub(super) struct CapturedRun {
    pub(super) status: Option<ExitStatus>,
    pub(super) stdout: String,
    pub(super) stderr: String,
    pub(super) timed_out: bool,
    pub(super) duration: Duration,
}

#[derive(Clone, Copy)]
enum Echo {
    Stdout,
    Stderr,
}

/// Spawn `cmd`, capture both streams, and kill it once `timeout` elapses.
pub(super) fn run_captured(
    mut cmd: Command,
    timeout: Option<Duration>,
    show_output: bool,
) -> Result<CapturedRun> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own process group, so a timeout reaches everything the test forked.
        cmd.process_group(0);
    }

    let start = Instant::now();
    let mut child = cmd.spawn().context("spawn test process")?;
    let stdout = child
        .stdout
        .take()
        .map(|pipe| drain(pipe, show_output.then_some(Echo::Stdout)));
    let stderr = child
        .stderr
        .take()
        .map(|pipe| drain(pipe, show_output.then_some(Echo::Stderr)));

    let (status, timed_out) = wait_with_timeout(&mut child, timeout)?;
    let grace = timed_out.then(|| Instant::now() + DRAIN_GRACE);
    let stdout = join_text(stdout, grace);
    let stderr = join_text(stderr, grace);

    Ok(CapturedRun {
        status,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Option<Duration>,
) -> Result<(Option<ExitStatus>, bool)> {
    let Some(timeout) = timeout else {
        let status = child.wait().context("wait for test process")?;
        return Ok((Some(status), false));
    };

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().context("check test process status")? {
            return Ok((Some(status), false));
        }
        if start.elapsed() > timeout {
            kill_tree(child);
            let status = child.wait().ok();
            tracing::warn!(
                timeout_secs = timeout.as_secs_f64(),
                "test process timed out and was killed"
            );
            return Ok((status, true));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: kill(2) takes no pointers; a negative pid addresses the group.
        unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        }
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

fn drain<R: Read + Send + 'static>(mut pipe: R, echo: Option<Echo>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut captured = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    let chunk = &buf[..read];
                    captured.extend_from_slice(chunk);
                    match echo {
                        Some(Echo::Stdout) => {
                            let _ = io::stdout().write_all(chunk);
                        }
                        Some(Echo::Stderr) => {
                            let _ = io::stderr().write_all(chunk);
                        }
                        None => {}
                    }
                }
            }
        }
        captured
    })
}

/// Join a drain thread. With a deadline, a pipe still held open by a stray
/// descendant is abandoned once the deadline passes.
fn join_text(handle: Option<JoinHandle<Vec<u8>>>, deadline: Option<Instant>) -> String {
    let handle = handle.filter(|handle| match deadline {
        None => true,
        Some(deadline) => {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(POLL_INTERVAL);
            }
            handle.is_finished()
        }
    });
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn captures_both_streams_and_status() {
        let run = run_captured(sh("echo out; echo err >&2; exit 3"), None, false)
            .expect("run shell");
        assert_eq!(run.stdout, "out\n");
        assert_eq!(run.stderr, "err\n");
        assert_eq!(run.status.and_then(|s| s.code()), Some(3));
        assert!(!run.timed_out);
    }

    #[test]
    fn kills_process_after_timeout() {
        let run = run_captured(
            sh("echo started; exec sleep 5"),
            Some(Duration::from_millis(200)),
            false,
        )
        .expect("run shell");
        assert!(run.timed_out);
        assert!(run.duration < Duration::from_secs(5));
        assert!(!run.status.map(|s| s.success()).unwrap_or(false));
    }

    #[test]
    fn timeout_kills_forked_descendants() {
        let start = Instant::now();
        let run = run_captured(
            sh("echo started; sleep 4; echo done"),
            Some(Duration::from_millis(200)),
            false,
        )
        .expect("run shell");
        assert!(run.timed_out);
        assert!(start.elapsed() < Duration::from_secs(3));
        assert!(run.duration >= Duration::from_millis(200));
        assert!(!run.stdout.contains("done"));
    }

    #[test]
    fn large_output_does_not_block() {
        let run = run_captured(
            sh("i=0; while [ $i -lt 20000 ]; do echo line $i; i=$((i+1)); done"),
            Some(Duration::from_secs(30)),
            false,
        )
        .expect("run shell");
        assert_eq!(run.stdout.lines().count(), 20000);
        assert!(!run.timed_out);
    }
}
