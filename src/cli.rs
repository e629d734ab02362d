//! CLI argument parsing for the dataset job runner.
use crate::locator::{InputUri, OutputUri};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "caldp",
    version,
    about = "Per-dataset calibration job runner",
    after_help = "Commands:\n  process <input-uri> <output-uri> <dataset>...  Acquire, calibrate, and deliver datasets\n  finalize <input-uri> <output-uri> <dataset>    Publish the final status of a deferred dataset\n  explain <code>                                 Describe an exit code\n  status                                         List live status records\n\nUris:\n  astroquery:[s3://bucket/poller-prefix]  s3://bucket/prefix  file:<dir>  none (output only)\n\nExamples:\n  caldp process astroquery: file:/data/outputs J8CB010B0\n  caldp process s3://inputs/batch-7 s3://calibrated/batch-7 IC0B02020\n  caldp process --defer-finalize file:/data/j8cb010b0 none J8CB010B0\n  caldp explain 23\n  caldp status --json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every command.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Job root holding inputs/, outputs/, and messages/ (defaults to the current directory)
    #[arg(long, value_name = "DIR", global = true)]
    pub work_dir: Option<PathBuf>,

    /// Job transcript path (defaults to process.txt under the job root)
    #[arg(long, value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Tracing filter used when RUST_LOG is not set
    #[arg(long, value_name = "FILTER", global = true, default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Process(ProcessArgs),
    Finalize(FinalizeArgs),
    Explain(ExplainArgs),
    Status(StatusArgs),
}

#[derive(Parser, Debug)]
#[command(about = "Acquire, calibrate, and deliver each dataset in turn")]
pub struct ProcessArgs {
    /// Where inputs come from: astroquery:, s3://bucket/prefix, or file:<dir>
    #[arg(value_name = "INPUT_URI")]
    pub input_uri: InputUri,

    /// Where outputs go: s3://bucket/prefix, file:<dir>, or none
    #[arg(value_name = "OUTPUT_URI")]
    pub output_uri: OutputUri,

    /// Dataset ids to process
    #[arg(value_name = "DATASET", required = true, num_args = 1..)]
    pub datasets: Vec<String>,

    /// Leave each dataset in processing so a preview step can run before finalize
    #[arg(long)]
    pub defer_finalize: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Publish the final status record of a deferred dataset")]
pub struct FinalizeArgs {
    /// Input uri the dataset was processed from
    #[arg(value_name = "INPUT_URI")]
    pub input_uri: InputUri,

    /// Output uri the dataset was processed to
    #[arg(value_name = "OUTPUT_URI")]
    pub output_uri: OutputUri,

    /// Dataset id to finalize
    #[arg(value_name = "DATASET")]
    pub dataset: String,
}

#[derive(Parser, Debug)]
#[command(about = "Describe an exit code; negative codes are UNIX signals")]
pub struct ExplainArgs {
    /// Exit code or negative signal number
    #[arg(value_name = "CODE", allow_negative_numbers = true)]
    pub code: i32,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "List live status records under messages/")]
pub struct StatusArgs {
    /// Only show records for this dataset
    #[arg(long, value_name = "DATASET")]
    pub dataset: Option<String>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        RootArgs::command().debug_assert();
    }

    #[test]
    fn process_parses_uris_and_datasets() {
        let args = RootArgs::try_parse_from([
            "caldp",
            "--work-dir",
            "/jobs/7",
            "process",
            "astroquery:",
            "none",
            "J8CB010B0",
            "IC0B02020",
        ])
        .expect("parse");
        assert_eq!(args.global.work_dir, Some(PathBuf::from("/jobs/7")));
        let Command::Process(process) = args.command else {
            panic!("expected process");
        };
        assert_eq!(process.input_uri, InputUri::Astroquery { poller: None });
        assert_eq!(process.output_uri, OutputUri::None);
        assert_eq!(process.datasets, vec!["J8CB010B0", "IC0B02020"]);
        assert!(!process.defer_finalize);
    }

    #[test]
    fn bad_uri_is_a_usage_error() {
        let err = RootArgs::try_parse_from(["caldp", "process", "ftp://x", "none", "J8CB010B0"])
            .expect_err("bad scheme");
        assert_eq!(err.exit_code(), 2);
        let err = RootArgs::try_parse_from(["caldp", "process", "astroquery:", "none"])
            .expect_err("no dataset");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn explain_accepts_signals() {
        let args = RootArgs::try_parse_from(["caldp", "explain", "-9", "--json"]).expect("parse");
        let Command::Explain(explain) = args.command else {
            panic!("expected explain");
        };
        assert_eq!(explain.code, -9);
        assert!(explain.json);
    }
}
