use crate::exec;
use crate::exit_codes::ExitCode;
use crate::sysexit::{JobExit, Runtime, SubprocessFailure};
use std::path::Path;

/// Run one external stage program on `args` inside `cwd`.
///
/// Statuses listed in `tolerated` are logged and treated as success; any
/// other non-zero status fails the guard with `code`.
pub fn run_external_stage(
    runtime: &Runtime<'_>,
    code: ExitCode,
    command: &str,
    args: &[String],
    cwd: &Path,
    tolerated: &[i32],
) -> Result<(), JobExit> {
    let log = runtime.log();
    runtime.guard(code, format!("Stage command {command} FAILED."), || {
        let mut argv = exec::split_command(command)?;
        argv.extend(args.iter().cloned());
        log.info(format!("Running: {}", shell_words::join(&argv)));
        let returncode = exec::run_streaming(log, &argv, cwd)?;
        if returncode == 0 {
            return Ok(());
        }
        if tolerated.contains(&returncode) {
            log.info(format!("Ignoring error status = {returncode}"));
            return Ok(());
        }
        log.error(format!(
            "Command: {} exited with error status: {returncode}",
            shell_words::join(&argv)
        ));
        Err(SubprocessFailure {
            program: argv[0].clone(),
            returncode,
        }
        .into())
    })
}
