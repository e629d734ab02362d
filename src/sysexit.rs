//! Guarded blocks and the top-level exit receiver.
//!
//! `Runtime::guard` maps any failure inside a block onto one `ExitCode`,
//! writes a single fatal report, and returns a `JobExit` that carries the
//! decided code up the stack untouched. `run_job` turns the outcome of the
//! whole job into the process status; nothing else decides how the process
//! exits.
//!
//! Memory faults are special: in-process allocation failures and OS
//! `Cannot allocate memory` errors override the code a guard was given, and a
//! failed job whose subprocess output contained `MemoryError` is promoted to
//! `SUBPROCESS_MEMORY_ERROR` by the receiver.
use crate::exit_codes::{explain, explain_signal, ExitCode};
use crate::log::{JobLog, Level};
use anyhow::{anyhow, Context, Result};
use std::cell::Cell;
use std::collections::TryReserveError;
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};

/// Substring the OS uses to describe `ENOMEM`.
pub const OS_MEMORY_MESSAGE: &str = "Cannot allocate memory";

/// Size of the raw allocation attempted when simulating container exhaustion.
pub const SIMULATED_ALLOCATION_BYTES: u64 = 1000 * 1024 * 1024 * 1024;

/// The decided outcome of a failed guarded block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("job exiting with {code}")]
pub struct JobExit {
    code: ExitCode,
}

impl JobExit {
    pub fn new(code: ExitCode) -> Self {
        Self { code }
    }

    pub fn code(&self) -> ExitCode {
        self.code
    }
}

/// A subprocess returned a status that was not tolerated.
///
/// A negative `returncode` is the signal number that killed the process.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{program} exited with error status {returncode}")]
pub struct SubprocessFailure {
    pub program: String,
    pub returncode: i32,
}

/// An in-process allocation could not be satisfied.
#[derive(Debug, thiserror::Error)]
#[error("memory exhausted allocating {what}")]
pub struct MemoryExhausted {
    what: String,
    #[source]
    source: Option<TryReserveError>,
}

impl MemoryExhausted {
    pub fn new(what: impl Into<String>) -> Self {
        Self {
            what: what.into(),
            source: None,
        }
    }

    pub fn from_reserve(what: impl Into<String>, source: TryReserveError) -> Self {
        Self {
            what: what.into(),
            source: Some(source),
        }
    }
}

/// The container-level raw allocation simulation.
#[derive(Debug, thiserror::Error)]
#[error("simulated container memory exhaustion ({bytes} byte allocation)")]
pub struct ContainerMemoryExhausted {
    bytes: u64,
}

/// Guarded execution bound to one job's log and fault-simulation setting.
///
/// A simulated fault is raised once per runtime; guards entered while the
/// job unwinds from it (finalization on the error path) run normally.
pub struct Runtime<'a> {
    log: &'a JobLog,
    simulate: Option<i32>,
    simulated: Cell<bool>,
}

impl<'a> Runtime<'a> {
    pub fn new(log: &'a JobLog, simulate: Option<i32>) -> Self {
        Self {
            log,
            simulate,
            simulated: Cell::new(false),
        }
    }

    pub fn log(&self) -> &'a JobLog {
        self.log
    }

    /// Run `body`, mapping any failure onto `code`.
    ///
    /// A failure that already carries a `JobExit` (from a nested guard) is
    /// returned as-is, so the innermost guard's context and code win.
    pub fn guard<T>(
        &self,
        code: ExitCode,
        context: impl Display,
        body: impl FnOnce() -> Result<T>,
    ) -> Result<T, JobExit> {
        let outcome = self.simulate(code).and_then(|()| body());
        match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                if let Some(exit) = find_exit(&err) {
                    return Err(exit);
                }
                let decided = classify(code, &err);
                self.report(decided, &context.to_string(), &err);
                Err(JobExit::new(decided))
            }
        }
    }

    fn simulate(&self, code: ExitCode) -> Result<()> {
        let Some(simulated) = self.simulate.filter(|_| !self.simulated.get()) else {
            return Ok(());
        };
        let fires = ExitCode::from_code(simulated).is_some_and(ExitCode::is_memory_error)
            || simulated == code.code();
        if !fires {
            return Ok(());
        }
        self.simulated.set(true);
        match ExitCode::from_code(simulated) {
            Some(ExitCode::CaldpMemoryError) => {
                Err(MemoryExhausted::new("simulated in-process buffer").into())
            }
            Some(ExitCode::SubprocessMemoryError) => {
                self.log
                    .echo("MemoryError: simulated subprocess memory exhaustion");
                Err(anyhow!(
                    "Simulated subprocess memory error with subsequent generic program failure."
                ))
            }
            Some(ExitCode::ContainerMemoryError) => self.simulate_container_allocation(),
            Some(ExitCode::OsMemoryError) => Err(std::io::Error::from_raw_os_error(libc::ENOMEM))
                .context("Simulated OS allocation failure"),
            _ if simulated == code.code() => Err(anyhow!("Simulating error = {simulated}")),
            _ => Ok(()),
        }
    }

    fn simulate_container_allocation(&self) -> Result<()> {
        self.log
            .info("Simulating hard memory error by allocating memory");
        let bytes = usize::try_from(SIMULATED_ALLOCATION_BYTES).unwrap_or(usize::MAX);
        let mut block: Vec<u8> = Vec::new();
        if block.try_reserve_exact(bytes).is_ok() {
            self.log
                .warning("Simulated allocation was granted without touching memory");
        }
        drop(block);
        Err(ContainerMemoryExhausted {
            bytes: SIMULATED_ALLOCATION_BYTES,
        }
        .into())
    }

    fn report(&self, code: ExitCode, context: &str, err: &anyhow::Error) {
        self.log.divider(Level::Error, "Fatal Exception");
        if !context.is_empty() {
            self.log.error(context);
        }
        for line in format!("{err:?}").lines() {
            self.log.error(line);
        }
        if let Some(failure) = find_cause::<SubprocessFailure>(err) {
            if failure.returncode < 0 {
                self.log.echo(&explain_signal(failure.returncode));
            }
        }
        self.log.echo(&explain(code.code()));
    }
}

/// Run the whole job and decide the process status.
///
/// Guarded failures were already reported and only contribute their code.
/// Anything else is reported here as untrapped. Panics are caught so they
/// also end in a reported code.
pub fn run_job(log: &JobLog, body: impl FnOnce() -> Result<()>) -> ExitCode {
    let outcome = panic::catch_unwind(AssertUnwindSafe(body));
    let code = match outcome {
        Ok(Ok(())) => ExitCode::Success,
        Ok(Err(err)) => match find_exit(&err) {
            Some(exit) => exit.code(),
            None if is_in_process_memory_error(&err) => {
                report_untrapped(log, "Untrapped memory exception", &err);
                log.echo(&explain(ExitCode::CaldpMemoryError.code()));
                ExitCode::CaldpMemoryError
            }
            None => {
                report_untrapped(log, "Untrapped exception", &err);
                log.echo(&explain(ExitCode::GenericError.code()));
                ExitCode::GenericError
            }
        },
        Err(payload) => {
            log.divider(Level::Error, "Untrapped exception");
            log.error(format!("panic: {}", panic_message(payload.as_ref())));
            log.echo(&explain(ExitCode::GenericError.code()));
            ExitCode::GenericError
        }
    };
    promote_subprocess_memory(log, code)
}

fn promote_subprocess_memory(log: &JobLog, code: ExitCode) -> ExitCode {
    if code == ExitCode::Success || code.is_memory_error() || !log.memory_error_seen() {
        return code;
    }
    log.echo(&explain(ExitCode::SubprocessMemoryError.code()));
    ExitCode::SubprocessMemoryError
}

fn report_untrapped(log: &JobLog, title: &str, err: &anyhow::Error) {
    log.divider(Level::Error, title);
    for line in format!("{err:?}").lines() {
        log.error(line);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    "non-string panic payload".to_string()
}

/// Final code for a failure raised inside a guard given `code`.
pub fn classify(code: ExitCode, err: &anyhow::Error) -> ExitCode {
    if is_in_process_memory_error(err) {
        return ExitCode::CaldpMemoryError;
    }
    if find_cause::<ContainerMemoryExhausted>(err).is_some() {
        return ExitCode::ContainerMemoryError;
    }
    if is_os_memory_error(err) {
        return ExitCode::OsMemoryError;
    }
    code
}

fn is_in_process_memory_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.is::<MemoryExhausted>() || cause.is::<TryReserveError>())
}

fn is_os_memory_error(err: &anyhow::Error) -> bool {
    let enomem = err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .and_then(|io| io.raw_os_error())
            == Some(libc::ENOMEM)
    });
    enomem || format!("{err:#} {err:?}").contains(OS_MEMORY_MESSAGE)
}

pub fn find_exit(err: &anyhow::Error) -> Option<JobExit> {
    find_cause::<JobExit>(err).copied()
}

fn find_cause<E: std::error::Error + 'static>(err: &anyhow::Error) -> Option<&E> {
    err.chain().find_map(|cause| cause.downcast_ref::<E>())
}

#[cfg(test)]
#[path = "sysexit_tests.rs"]
mod tests;
