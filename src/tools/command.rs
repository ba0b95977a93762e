//! Bounded-wait external process execution
//!
//! Changer and mount/unmount commands are arbitrary operator-supplied
//! programs. They run with a hard timeout so a wedged changer script
//! cannot hang a job forever.

use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};

/// Helper to check the captured output of a finished command.
///
/// The exit_code_check() function should return true if the exit code
/// is considered successful.
pub fn command_output(
    output: std::process::Output,
    exit_code_check: Option<fn(i32) -> bool>,
) -> Result<Vec<u8>, Error> {
    if !output.status.success() {
        match output.status.code() {
            Some(code) => {
                let is_ok = match exit_code_check {
                    Some(check_fn) => check_fn(code),
                    None => code == 0,
                };
                if !is_ok {
                    let msg = String::from_utf8(output.stderr)
                        .map(|m| {
                            if m.is_empty() {
                                String::from("no error message")
                            } else {
                                m
                            }
                        })
                        .unwrap_or_else(|_| String::from("non utf8 error message (suppressed)"));

                    bail!("status code: {} - {}", code, msg);
                }
            }
            None => bail!("terminated by signal"),
        }
    }

    Ok(output.stdout)
}

/// Run a command, capture stdout and enforce a timeout.
///
/// On timeout the child is killed and an error is returned; a timed
/// out changer command is treated like any other command failure.
pub fn run_command(
    mut command: Command,
    exit_code_check: Option<fn(i32) -> bool>,
    timeout: Duration,
) -> Result<String, Error> {
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|err| format_err!("failed to execute {:?} - {}", command, err))?;

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    bail!("command {:?} timed out after {:?}", command, timeout);
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => bail!("wait for {:?} failed - {}", command, err),
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|err| format_err!("wait for {:?} failed - {}", command, err))?;

    let output = command_output(output, exit_code_check)
        .map_err(|err| format_err!("command {:?} failed - {}", command, err))?;

    let output = String::from_utf8(output)?;

    Ok(output)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn captures_stdout() -> Result<(), Error> {
        let mut command = Command::new("echo");
        command.arg("loaded");
        let out = run_command(command, None, Duration::from_secs(10))?;
        assert_eq!(out.trim(), "loaded");
        Ok(())
    }

    #[test]
    fn nonzero_exit_fails() {
        let mut command = Command::new("sh");
        command.args(["-c", "exit 3"]);
        assert!(run_command(command, None, Duration::from_secs(10)).is_err());

        let mut command = Command::new("sh");
        command.args(["-c", "exit 3"]);
        let checked = run_command(command, Some(|code| code == 3), Duration::from_secs(10));
        assert!(checked.is_ok());
    }

    #[test]
    fn timeout_kills_child() {
        let mut command = Command::new("sleep");
        command.arg("30");
        let start = Instant::now();
        let res = run_command(command, None, Duration::from_millis(200));
        assert!(res.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
