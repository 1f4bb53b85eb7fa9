//! Running short-lived system tools without letting them outlive a deadline.

use std::io::Read;
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

const CHILD_POLL: Duration = Duration::from_millis(20);

/// Run `program` and collect its stdout. The child is killed and `None`
/// returned if it has not exited by `deadline`.
pub(crate) fn run_until(program: &str, args: &[String], deadline: Instant) -> Option<(ExitStatus, String)> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .ok()?;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() < deadline => std::thread::sleep(CHILD_POLL),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                debug!(program, "killed at deadline");
                return None;
            }
        }
    };

    let mut out = String::new();
    child.stdout.take()?.read_to_string(&mut out).ok()?;
    Some((status, out))
}
