//! External program invocation with output streamed into the job log.
use crate::log::JobLog;
use anyhow::{anyhow, Context, Result};
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;

/// Split a configured command string such as `cs0.e -tv` into argv.
pub fn split_command(command: &str) -> Result<Vec<String>> {
    let argv =
        shell_words::split(command).with_context(|| format!("parse command: {command}"))?;
    if argv.is_empty() {
        return Err(anyhow!("command is empty"));
    }
    Ok(argv)
}

/// Signed return code: the exit status, or the negated signal number when
/// the process was killed by a signal.
pub fn signed_returncode(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}

/// Run `argv` in `cwd`, echoing each stdout/stderr line into `log` as it
/// arrives, and return the signed return code.
///
/// A program name without a `/` is looked up on `PATH` first so a missing
/// executable is reported by name.
pub fn run_streaming(log: &JobLog, argv: &[String], cwd: &Path) -> Result<i32> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("command is empty"))?;
    let resolved = if program.contains('/') {
        Path::new(program).to_path_buf()
    } else {
        which::which(program).with_context(|| format!("find {program} on PATH"))?
    };

    let mut child = Command::new(&resolved)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {program}"))?;

    let (tx, rx) = mpsc::channel::<String>();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(forward_lines(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(forward_lines(stderr, tx.clone()));
    }
    drop(tx);
    for line in rx {
        log.echo(&line);
    }
    for reader in readers {
        let _ = reader.join();
    }

    let status = child
        .wait()
        .with_context(|| format!("wait for {program}"))?;
    let returncode = signed_returncode(status);
    tracing::debug!(program = %program, returncode, "subprocess finished");
    Ok(returncode)
}

fn forward_lines<R: Read + Send + 'static>(
    stream: R,
    tx: mpsc::Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.split(b'\n') {
            let Ok(bytes) = line else {
                break;
            };
            let text = String::from_utf8_lossy(&bytes)
                .trim_end_matches('\r')
                .to_string();
            if tx.send(text).is_err() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn split_command_handles_switches() {
        assert_eq!(
            split_command("cs0.e -tv").expect("split"),
            vec!["cs0.e".to_string(), "-tv".to_string()]
        );
        assert!(split_command("   ").is_err());
        assert!(split_command("unterminated 'quote").is_err());
    }

    #[test]
    fn output_lines_are_echoed_and_status_returned() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = JobLog::capturing();
        let code = run_streaming(
            &log,
            &sh("echo calibrating; echo warning >&2; pwd; exit 3"),
            dir.path(),
        )
        .expect("run");
        assert_eq!(code, 3);
        let lines = log.captured_lines();
        assert!(lines.contains(&"calibrating".to_string()));
        assert!(lines.contains(&"warning".to_string()));
        let cwd = dir.path().canonicalize().expect("canonical");
        assert!(lines
            .iter()
            .any(|line| Path::new(line) == cwd || Path::new(line) == dir.path()));
    }

    #[test]
    fn signal_death_is_negative() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = JobLog::capturing();
        let code = run_streaming(&log, &sh("kill -8 $$"), dir.path()).expect("run");
        assert_eq!(code, -8);
    }

    #[test]
    fn missing_program_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = JobLog::capturing();
        let err = run_streaming(
            &log,
            &["definitely-not-a-calibration-program".to_string()],
            dir.path(),
        )
        .expect_err("missing program");
        assert!(format!("{err:#}").contains("definitely-not-a-calibration-program"));
    }
}
