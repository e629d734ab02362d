//! Closed set of process exit codes reported by a calibration job.
//!
//! Every failure is eventually mapped onto one of these values so the batch
//! layer can tell which phase failed from the numeric status alone. Values are
//! fixed; add new variants rather than renumbering existing ones.
use serde::Serialize;
use std::fmt;

/// A fault category and its numeric process status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitCode {
    Success,
    GenericError,
    CmdlineError,
    InputTarFileError,
    AstroqueryError,
    Stage1Error,
    Stage2Error,
    S3UploadError,
    S3DownloadError,
    BestrefsError,
    CreatePreviewsError,
    SvmWorkflowError,
    MvmWorkflowError,
    CaldpMemoryError,
    SubprocessMemoryError,
    ContainerMemoryError,
    OsMemoryError,
}

impl ExitCode {
    pub const ALL: [ExitCode; 17] = [
        ExitCode::Success,
        ExitCode::GenericError,
        ExitCode::CmdlineError,
        ExitCode::InputTarFileError,
        ExitCode::AstroqueryError,
        ExitCode::Stage1Error,
        ExitCode::Stage2Error,
        ExitCode::S3UploadError,
        ExitCode::S3DownloadError,
        ExitCode::BestrefsError,
        ExitCode::CreatePreviewsError,
        ExitCode::SvmWorkflowError,
        ExitCode::MvmWorkflowError,
        ExitCode::CaldpMemoryError,
        ExitCode::SubprocessMemoryError,
        ExitCode::ContainerMemoryError,
        ExitCode::OsMemoryError,
    ];

    /// Numeric process status for this code.
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::GenericError => 1,
            ExitCode::CmdlineError => 2,
            ExitCode::InputTarFileError => 21,
            ExitCode::AstroqueryError => 22,
            ExitCode::Stage1Error => 23,
            ExitCode::Stage2Error => 24,
            ExitCode::S3UploadError => 25,
            ExitCode::S3DownloadError => 26,
            ExitCode::BestrefsError => 27,
            ExitCode::CreatePreviewsError => 28,
            ExitCode::SvmWorkflowError => 29,
            ExitCode::MvmWorkflowError => 30,
            ExitCode::CaldpMemoryError => 31,
            ExitCode::SubprocessMemoryError => 32,
            ExitCode::ContainerMemoryError => 33,
            ExitCode::OsMemoryError => 34,
        }
    }

    pub fn from_code(code: i32) -> Option<ExitCode> {
        Self::ALL.into_iter().find(|candidate| candidate.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            ExitCode::Success => "SUCCESS",
            ExitCode::GenericError => "GENERIC_ERROR",
            ExitCode::CmdlineError => "CMDLINE_ERROR",
            ExitCode::InputTarFileError => "INPUT_TAR_FILE_ERROR",
            ExitCode::AstroqueryError => "ASTROQUERY_ERROR",
            ExitCode::Stage1Error => "STAGE1_ERROR",
            ExitCode::Stage2Error => "STAGE2_ERROR",
            ExitCode::S3UploadError => "S3_UPLOAD_ERROR",
            ExitCode::S3DownloadError => "S3_DOWNLOAD_ERROR",
            ExitCode::BestrefsError => "BESTREFS_ERROR",
            ExitCode::CreatePreviewsError => "CREATE_PREVIEWS_ERROR",
            ExitCode::SvmWorkflowError => "SVM_WORKFLOW_ERROR",
            ExitCode::MvmWorkflowError => "MVM_WORKFLOW_ERROR",
            ExitCode::CaldpMemoryError => "CALDP_MEMORY_ERROR",
            ExitCode::SubprocessMemoryError => "SUBPROCESS_MEMORY_ERROR",
            ExitCode::ContainerMemoryError => "CONTAINER_MEMORY_ERROR",
            ExitCode::OsMemoryError => "OS_MEMORY_ERROR",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ExitCode::Success => "Processing completed successfully.",
            ExitCode::GenericError => "An error with no specific exit code occurred.",
            ExitCode::CmdlineError => "The program command line invocation was incorrect.",
            ExitCode::InputTarFileError => {
                "An error occurred extracting the input archive downloaded from object storage."
            }
            ExitCode::AstroqueryError => "An error occurred retrieving inputs by remote query.",
            ExitCode::Stage1Error => {
                "An error occurred in this instrument's stage1 processing step. e.g. calxxx"
            }
            ExitCode::Stage2Error => {
                "An error occurred in this instrument's stage2 processing step, e.g astrodrizzle"
            }
            ExitCode::S3UploadError => "An error occurred uploading outputs to object storage.",
            ExitCode::S3DownloadError => {
                "An error occurred downloading inputs from object storage."
            }
            ExitCode::BestrefsError => {
                "An error occurred computing or downloading best reference files."
            }
            ExitCode::CreatePreviewsError => "An error occurred creating preview files.",
            ExitCode::SvmWorkflowError => "An error occurred in the single visit mosaic workflow.",
            ExitCode::MvmWorkflowError => "An error occurred in the multi visit mosaic workflow.",
            ExitCode::CaldpMemoryError => "The orchestrator itself ran out of memory.",
            ExitCode::SubprocessMemoryError => {
                "A processing subprocess reported a MemoryError in its output."
            }
            ExitCode::ContainerMemoryError => {
                "The container ran out of memory attempting a raw allocation."
            }
            ExitCode::OsMemoryError => {
                "The OS refused an allocation (Cannot allocate memory), possibly fork failure."
            }
        }
    }

    /// Memory-pressure codes supersede whatever code a guard was given.
    pub fn is_memory_error(self) -> bool {
        matches!(
            self,
            ExitCode::CaldpMemoryError
                | ExitCode::SubprocessMemoryError
                | ExitCode::ContainerMemoryError
                | ExitCode::OsMemoryError
        )
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(u8::try_from(code.code()).unwrap_or(1))
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name(), self.code())
    }
}

/// Machine-readable explanation used by `caldp explain --json`.
#[derive(Debug, Serialize)]
pub struct Explanation {
    pub code: i32,
    pub name: String,
    pub text: String,
}

impl Explanation {
    pub fn for_code(code: i32) -> Self {
        match ExitCode::from_code(code) {
            Some(known) => Self {
                code,
                name: known.name().to_string(),
                text: known.description().to_string(),
            },
            None => Self {
                code,
                name: "UNKNOWN".to_string(),
                text: "Unrecognized exit code.".to_string(),
            },
        }
    }
}

/// Human readable text for numeric exit `code`.
pub fn explain(code: i32) -> String {
    let explanation = Explanation::for_code(code);
    format!(
        "EXIT - {}[{}]: {}",
        explanation.name, explanation.code, explanation.text
    )
}

const SIGNALS: &[(libc::c_int, &str, &str)] = &[
    (libc::SIGHUP, "SIGHUP", "Hangup (POSIX)."),
    (libc::SIGINT, "SIGINT", "Interrupt (ANSI)."),
    (libc::SIGQUIT, "SIGQUIT", "Quit (POSIX)."),
    (libc::SIGILL, "SIGILL", "Illegal instruction (ANSI)."),
    (libc::SIGTRAP, "SIGTRAP", "Trace trap (POSIX)."),
    (libc::SIGABRT, "SIGABRT", "Abort (ANSI)."),
    (libc::SIGBUS, "SIGBUS", "BUS error (4.2 BSD)."),
    (libc::SIGFPE, "SIGFPE", "Floating-point exception (ANSI)."),
    (libc::SIGKILL, "SIGKILL", "Kill, unblockable (POSIX)."),
    (libc::SIGUSR1, "SIGUSR1", "User-defined signal 1 (POSIX)."),
    (libc::SIGSEGV, "SIGSEGV", "Segmentation violation (ANSI)."),
    (libc::SIGUSR2, "SIGUSR2", "User-defined signal 2 (POSIX)."),
    (libc::SIGPIPE, "SIGPIPE", "Broken pipe (POSIX)."),
    (libc::SIGALRM, "SIGALRM", "Alarm clock (POSIX)."),
    (libc::SIGTERM, "SIGTERM", "Termination (ANSI)."),
    (libc::SIGCHLD, "SIGCHLD", "Child status has changed (POSIX)."),
    (libc::SIGCONT, "SIGCONT", "Continue (POSIX)."),
    (libc::SIGSTOP, "SIGSTOP", "Stop, unblockable (POSIX)."),
    (libc::SIGTSTP, "SIGTSTP", "Keyboard stop (POSIX)."),
    (libc::SIGTTIN, "SIGTTIN", "Background read from tty (POSIX)."),
    (libc::SIGTTOU, "SIGTTOU", "Background write to tty (POSIX)."),
    (libc::SIGXCPU, "SIGXCPU", "CPU limit exceeded (4.2 BSD)."),
    (libc::SIGXFSZ, "SIGXFSZ", "File size limit exceeded (4.2 BSD)."),
    (libc::SIGSYS, "SIGSYS", "Bad system call."),
];

/// Explain the UNIX signal that killed a subprocess.
///
/// Subprocess deaths are reported as negative return codes, so callers may
/// pass either sign.
pub fn explain_signal(signum: i32) -> String {
    let signum = signum.abs();
    match SIGNALS.iter().find(|(number, _, _)| *number == signum) {
        Some((_, name, text)) => {
            format!("EXIT - Killed by UNIX signal {name}[{signum}]: '{text}'")
        }
        None => format!("EXIT - Killed by unrecognized UNIX signal [{signum}]."),
    }
}
