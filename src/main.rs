use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod archive;
mod bestrefs;
mod cli;
mod config;
mod dataset;
mod exec;
mod exit_codes;
mod fits;
mod locator;
mod log;
mod messages;
mod paths;
mod pipeline;
mod process;
mod retrieve;
mod retry;
mod storage;
mod sysexit;
mod util;

use crate::bestrefs::CommandBestRefs;
use crate::cli::{Command, ExplainArgs, GlobalArgs, RootArgs, StatusArgs};
use crate::config::Settings;
use crate::exit_codes::{ExitCode, Explanation};
use crate::log::JobLog;
use crate::paths::JobPaths;
use crate::pipeline::Collaborators;
use crate::process::JobContext;
use crate::retrieve::HttpRetriever;
use crate::storage::FsObjectStore;
use crate::sysexit::{run_job, Runtime};

fn main() -> std::process::ExitCode {
    let args = match RootArgs::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let _ = err.print();
            let code = if err.use_stderr() {
                ExitCode::CmdlineError
            } else {
                ExitCode::Success
            };
            return code.into();
        }
    };
    init_tracing(&args.global.log_level);

    let outcome = match args.command {
        Command::Explain(explain) => run_explain(&explain),
        Command::Status(status) => run_status(&args.global, &status),
        command => return run_dataset_job(&args.global, command).into(),
    };
    match outcome {
        Ok(()) => ExitCode::Success.into(),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::GenericError.into()
        }
    }
}

fn init_tracing(level: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| level.to_string());
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter)))
        .init();
}

fn run_explain(args: &ExplainArgs) -> Result<()> {
    if args.json {
        let explanation = Explanation::for_code(args.code);
        let text = serde_json::to_string_pretty(&explanation).context("serialize explanation")?;
        println!("{text}");
    } else if args.code < 0 {
        println!("{}", exit_codes::explain_signal(args.code));
    } else {
        println!("{}", exit_codes::explain(args.code));
    }
    Ok(())
}

fn run_status(global: &GlobalArgs, args: &StatusArgs) -> Result<()> {
    let paths = JobPaths::new(job_root(global)?);
    let markers: Vec<_> = messages::list_markers(&paths.messages_dir())?
        .into_iter()
        .filter(|marker| {
            args.dataset
                .as_deref()
                .is_none_or(|dataset| marker.dataset.eq_ignore_ascii_case(dataset))
        })
        .collect();
    if args.json {
        let text = serde_json::to_string_pretty(&markers).context("serialize status records")?;
        println!("{text}");
        return Ok(());
    }
    if markers.is_empty() {
        println!("No status records under {}", paths.messages_dir().display());
    }
    for marker in &markers {
        println!("{:<12} {:<10} {}", marker.dataset, marker.status, marker.name);
    }
    Ok(())
}

fn job_root(global: &GlobalArgs) -> Result<PathBuf> {
    match &global.work_dir {
        Some(dir) => Ok(dir.clone()),
        None => std::env::current_dir().context("resolve current directory"),
    }
}

/// Run `process` or `finalize` under the top-level exit receiver.
fn run_dataset_job(global: &GlobalArgs, command: Command) -> ExitCode {
    let root = match job_root(global) {
        Ok(root) => root,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::CmdlineError;
        }
    };
    let paths = JobPaths::new(root);
    let log_path = global.log_file.clone().unwrap_or_else(|| paths.log_path());
    let log = match JobLog::with_file(&log_path) {
        Ok(log) => log,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::GenericError;
        }
    };

    let code = run_job(&log, || {
        let settings = Runtime::new(&log, None).guard(
            ExitCode::CmdlineError,
            "Invalid job settings.",
            Settings::from_env,
        )?;
        let runtime = Runtime::new(&log, settings.simulate_error);
        let store = runtime.guard(
            ExitCode::GenericError,
            "Object store setup FAILED.",
            || Ok(FsObjectStore::new(settings.resolve_object_store_root()?)),
        )?;
        let retriever = HttpRetriever::new(
            settings.retrieve_url.clone(),
            settings.product_list_url.clone(),
        );
        let assigner = CommandBestRefs::new(settings.bestrefs_command.clone(), &log);
        let context = JobContext {
            runtime: &runtime,
            paths: &paths,
            settings: &settings,
            collaborators: Collaborators {
                retriever: &retriever,
                assigner: &assigner,
                store: &store,
            },
        };
        match command {
            Command::Process(args) => context.process_datasets(
                &args.input_uri,
                &args.output_uri,
                &args.datasets,
                args.defer_finalize,
            )?,
            Command::Finalize(args) => {
                let status = context.finalize(&args.input_uri, &args.output_uri, &args.dataset)?;
                process::status_exit(status)?;
            }
            Command::Explain(_) | Command::Status(_) => {}
        }
        Ok(())
    });
    log.close();
    if code != ExitCode::Success {
        if let Some(path) = log.path() {
            eprintln!("{} (see {})", exit_codes::explain(code.code()), path.display());
        }
    }
    code
}
