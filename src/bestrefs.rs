//! Best reference assignment.
//!
//! Reference selection itself lives in an external tool; the job only decides
//! which files to annotate and whether reference files may be synced into the
//! local cache.
use crate::exec;
use crate::log::JobLog;
use crate::sysexit::SubprocessFailure;
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

pub trait ReferenceAssigner {
    /// Write best reference keywords into `files`, syncing the referenced
    /// files into the cache when `sync_references` is set.
    fn assign(&self, files: &[PathBuf], context: Option<&str>, sync_references: bool)
        -> Result<()>;
}

/// Runs a `crds bestrefs` style command line in the directory holding the
/// selected files.
pub struct CommandBestRefs<'a> {
    command: String,
    log: &'a JobLog,
}

impl<'a> CommandBestRefs<'a> {
    pub fn new(command: impl Into<String>, log: &'a JobLog) -> Self {
        Self {
            command: command.into(),
            log,
        }
    }

    pub fn argv(
        &self,
        files: &[PathBuf],
        context: Option<&str>,
        sync_references: bool,
    ) -> Result<Vec<String>> {
        let mut argv = exec::split_command(&self.command)?;
        argv.push("--files".to_string());
        argv.extend(files.iter().map(|file| file.display().to_string()));
        if sync_references {
            argv.push("--sync-references=1".to_string());
        }
        argv.push("--update-bestrefs".to_string());
        if let Some(context) = context {
            argv.push("--new-context".to_string());
            argv.push(context.to_string());
        }
        Ok(argv)
    }
}

impl ReferenceAssigner for CommandBestRefs<'_> {
    fn assign(
        &self,
        files: &[PathBuf],
        context: Option<&str>,
        sync_references: bool,
    ) -> Result<()> {
        if files.is_empty() {
            return Err(anyhow!("no files selected for reference assignment"));
        }
        let argv = self.argv(files, context, sync_references)?;
        self.log.info(format!("Running: {}", shell_words::join(&argv)));
        let cwd = files[0]
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let returncode = exec::run_streaming(self.log, &argv, cwd)?;
        if returncode != 0 {
            return Err(SubprocessFailure {
                program: argv[0].clone(),
                returncode,
            }
            .into());
        }
        Ok(())
    }
}
