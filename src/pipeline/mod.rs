//! Per-dataset pipeline management.
//!
//! One `PipelineManager` drives a dataset through acquisition, reference
//! assignment, the stage programs, and output collection. Everything that
//! differs between dataset kinds lives in the selected `Descriptor`.
pub mod collect;
pub mod descriptor;
pub mod stage;

pub use descriptor::{select_descriptor, Descriptor};

use crate::bestrefs::ReferenceAssigner;
use crate::config::{self, Settings};
use crate::dataset::{ClassificationError, DatasetId};
use crate::exit_codes::ExitCode;
use crate::fits::{self, CardValue};
use crate::locator::{self, InputUri, OutputTarget, OutputUri};
use crate::log::Level;
use crate::paths::{self, JobPaths};
use crate::retrieve::{self, Retriever};
use crate::retry::retry;
use crate::storage::{ObjectStore, S3Location};
use crate::sysexit::{JobExit, Runtime};
use crate::util;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Lifecycle position of one dataset job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Started,
    InputAcquired,
    ReferencesAssigned,
    Processed,
    OutputsCollected,
    Completed,
    Failed(ExitCode),
}

/// External services a pipeline run talks to.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub retriever: &'a dyn Retriever,
    pub assigner: &'a dyn ReferenceAssigner,
    pub store: &'a dyn ObjectStore,
}

pub struct PipelineManager<'a> {
    dataset: DatasetId,
    descriptor: &'static Descriptor,
    input: &'a InputUri,
    target: OutputTarget,
    paths: &'a JobPaths,
    settings: &'a Settings,
    runtime: &'a Runtime<'a>,
    collaborators: Collaborators<'a>,
    state: JobState,
    work_dir: Option<PathBuf>,
}

impl<'a> PipelineManager<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dataset: DatasetId,
        input: &'a InputUri,
        output: &OutputUri,
        paths: &'a JobPaths,
        settings: &'a Settings,
        runtime: &'a Runtime<'a>,
        collaborators: Collaborators<'a>,
    ) -> Result<Self, ClassificationError> {
        let descriptor = select_descriptor(&dataset)?;
        let target = locator::resolve_output_path(output, &dataset);
        Ok(Self {
            dataset,
            descriptor,
            input,
            target,
            paths,
            settings,
            runtime,
            collaborators,
            state: JobState::Started,
            work_dir: None,
        })
    }

    /// Swap in another descriptor, such as one whose stages are test
    /// doubles.
    #[cfg(test)]
    fn with_descriptor(mut self, descriptor: &'static Descriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn descriptor(&self) -> &'static Descriptor {
        self.descriptor
    }

    pub fn target(&self) -> &OutputTarget {
        &self.target
    }

    /// Directory the inputs live in and the stages run in.
    pub fn work_dir(&self) -> PathBuf {
        self.work_dir
            .clone()
            .unwrap_or_else(|| self.paths.input_dir(&self.dataset))
    }

    /// Run every phase in order, returning the staged output files.
    pub fn run(&mut self) -> Result<Vec<PathBuf>, JobExit> {
        let result = self.run_phases();
        match &result {
            Ok(_) => self.state = JobState::Completed,
            Err(exit) => self.state = JobState::Failed(exit.code()),
        }
        result
    }

    fn run_phases(&mut self) -> Result<Vec<PathBuf>, JobExit> {
        let log = self.runtime.log();
        log.divider(
            Level::Info,
            &format!(
                "Started processing for {} {}",
                self.descriptor.name, self.dataset
            ),
        );
        let files = self.acquire_inputs()?;
        self.assign_references(&files)?;
        self.run_stages(&files)?;
        let staged = self.collect_outputs()?;
        log.divider(
            Level::Info,
            &format!(
                "Completed processing for {} {}",
                self.descriptor.name, self.dataset
            ),
        );
        Ok(staged)
    }

    /// Fetch or locate the inputs, returning sorted absolute paths.
    pub fn acquire_inputs(&mut self) -> Result<Vec<PathBuf>, JobExit> {
        let runtime = self.runtime;
        let log = runtime.log();
        log.divider(Level::Info, &format!("{} Acquiring inputs", self.dataset));
        let dir = runtime.guard(
            ExitCode::GenericError,
            format!("Preparing input directory for {} FAILED.", self.dataset),
            || locator::resolve_input_path(self.input, &self.dataset, self.paths),
        )?;
        let patterns = self.descriptor.input_patterns(&self.dataset);
        let files = match self.input {
            InputUri::Local(_) => runtime.guard(
                ExitCode::GenericError,
                format!("Locating inputs in {} FAILED.", dir.display()),
                || {
                    let files = util::find_matching(&dir, &patterns)?;
                    if files.is_empty() {
                        return Err(anyhow!(
                            "no input files for {} in {}",
                            self.dataset,
                            dir.display()
                        ));
                    }
                    Ok(files)
                },
            )?,
            InputUri::ObjectStore(prefix) => locator::fetch_archive(
                runtime,
                self.collaborators.store,
                prefix,
                &self.dataset,
                &dir,
                &patterns,
            )?,
            InputUri::Astroquery { poller } => runtime.guard(
                ExitCode::AstroqueryError,
                format!("Astroquery retrieval of {} FAILED.", self.dataset),
                || self.retrieve_inputs(&dir, poller.as_ref(), &patterns),
            )?,
        };
        for file in &files {
            log.info(format!("Input: {}", util::display_path(file, Some(&dir))));
        }
        self.work_dir = Some(dir);
        self.state = JobState::InputAcquired;
        Ok(files)
    }

    fn retrieve_inputs(
        &self,
        dir: &Path,
        poller: Option<&S3Location>,
        patterns: &[String],
    ) -> Result<Vec<PathBuf>> {
        let log = self.runtime.log();
        if self.descriptor.is_mosaic() {
            let poller_path = self.fetch_poller(dir, poller)?;
            let text = fs::read_to_string(&poller_path)
                .with_context(|| format!("read {}", poller_path.display()))?;
            for name in retrieve::parse_poller(&text) {
                let fetched = retry(
                    &self.settings.retry,
                    log,
                    &format!("Retrieving {name}"),
                    || self.collaborators.retriever.fetch(&name, dir),
                )?;
                match fetched {
                    Some(path) => log.info(format!("Retrieved {}", util::file_name_str(&path))),
                    None => log.debug(format!("No product {name} in the archive")),
                }
            }
        } else {
            let suffixes = self.descriptor.retrieval_suffixes;
            log.info(format!(
                "Retrieving {} products with suffixes {}",
                self.dataset,
                suffixes.join(", ")
            ));
            let fetched = retry(
                &self.settings.retry,
                log,
                &format!("Retrieving {}", self.dataset),
                || {
                    self.collaborators
                        .retriever
                        .retrieve(self.dataset.as_str(), suffixes, dir)
                },
            )?;
            for path in &fetched {
                log.info(format!("Retrieved {}", util::file_name_str(path)));
            }
        }
        let files = util::find_matching(dir, patterns)?;
        if files.is_empty() {
            return Err(anyhow!("no input files retrieved for {}", self.dataset));
        }
        Ok(files)
    }

    fn fetch_poller(&self, dir: &Path, poller: Option<&S3Location>) -> Result<PathBuf> {
        let name = retrieve::poller_file_name(&self.dataset.lower());
        match poller {
            Some(prefix) => {
                let source = prefix.join(&name);
                let dest = dir.join(&name);
                self.collaborators.store.get(&source, &dest)?;
                Ok(dest)
            }
            None => self
                .collaborators
                .retriever
                .fetch(&name, dir)?
                .ok_or_else(|| anyhow!("poller file {name} is not available")),
        }
    }

    /// Annotate the raw inputs with best references.
    pub fn assign_references(&mut self, files: &[PathBuf]) -> Result<(), JobExit> {
        let runtime = self.runtime;
        let log = runtime.log();
        let raw = (self.descriptor.hooks.raw_files)(files);
        if raw.is_empty() {
            if self.descriptor.is_mosaic() {
                log.info(format!(
                    "{} inputs are already calibrated; skipping bestrefs.",
                    self.dataset
                ));
            } else {
                log.warning(format!(
                    "No raw files for {}; skipping bestrefs.",
                    self.dataset
                ));
            }
            self.state = JobState::ReferencesAssigned;
            return Ok(());
        }
        log.divider(
            Level::Info,
            &format!("{} Computing bestrefs and downloading references", self.dataset),
        );
        let sync_references = !self.settings.readonly_cache;
        if !sync_references {
            log.info("Reference cache is read-only; annotating without syncing.");
        }
        runtime.guard(
            ExitCode::BestrefsError,
            format!("Bestrefs for {} FAILED.", self.dataset),
            || {
                retry(&self.settings.retry, log, "Bestrefs", || {
                    self.collaborators.assigner.assign(
                        &raw,
                        self.settings.crds_context.as_deref(),
                        sync_references,
                    )
                })
            },
        )?;
        log.divider(Level::Info, "Bestrefs complete");
        self.state = JobState::ReferencesAssigned;
        Ok(())
    }

    /// Run the associated branch or the unassociated branch, never both.
    pub fn run_stages(&mut self, files: &[PathBuf]) -> Result<(), JobExit> {
        let runtime = self.runtime;
        let log = runtime.log();
        let work_dir = self.work_dir();
        let descriptor = self.descriptor;

        runtime.guard(
            ExitCode::GenericError,
            format!("Recording versions for {} FAILED.", self.dataset),
            || self.track_versions(files, &work_dir),
        )?;
        runtime.guard(
            ExitCode::GenericError,
            format!("Preparing {} inputs FAILED.", descriptor.name),
            || (descriptor.hooks.pre_stage)(files),
        )?;

        let assoc = (descriptor.hooks.assoc_files)(files);
        if !assoc.is_empty() {
            let args = basenames(&assoc);
            log.divider(Level::Info, &format!("{} Processing associations", self.dataset));
            stage::run_external_stage(
                runtime,
                descriptor.stage1_code,
                descriptor.stage1,
                &args,
                &work_dir,
                descriptor.tolerated,
            )?;
            if let Some(stage2) = descriptor.stage2 {
                stage::run_external_stage(
                    runtime,
                    descriptor.stage2_code,
                    stage2,
                    &args,
                    &work_dir,
                    descriptor.tolerated,
                )?;
            }
        } else {
            let unassoc = (descriptor.hooks.unassoc_files)(files);
            if unassoc.is_empty() {
                log.warning(format!(
                    "No stage inputs for {}; nothing to calibrate.",
                    self.dataset
                ));
            } else {
                let args = basenames(&unassoc);
                log.divider(Level::Info, &format!("{} Processing exposures", self.dataset));
                stage::run_external_stage(
                    runtime,
                    descriptor.stage1_code,
                    descriptor.stage1,
                    &args,
                    &work_dir,
                    descriptor.tolerated,
                )?;
                if let (true, Some(stage2)) = (descriptor.stage2_unassociated, descriptor.stage2) {
                    stage::run_external_stage(
                        runtime,
                        descriptor.stage2_code,
                        stage2,
                        &args,
                        &work_dir,
                        descriptor.tolerated,
                    )?;
                }
            }
        }
        self.state = JobState::Processed;
        Ok(())
    }

    /// Stamp provenance keywords on raw files and write the environment
    /// snapshot beside them.
    fn track_versions(&self, files: &[PathBuf], work_dir: &Path) -> Result<()> {
        let version = CardValue::Str(env!("CARGO_PKG_VERSION").to_string());
        let csys = CardValue::Str(self.settings.csys_ver.clone());
        for file in (self.descriptor.hooks.raw_files)(files) {
            if !util::file_name_str(&file).contains("_raw") {
                continue;
            }
            fits::set_keywords(
                &file,
                &[("CSYS_VER", csys.clone()), ("CALDPVER", version.clone())],
            )?;
        }
        let snapshot = config::environment_snapshot(std::env::vars());
        let mut text = snapshot.join("\n");
        text.push('\n');
        let path = work_dir.join(paths::env_snapshot_name(&self.dataset));
        util::write_atomic(&path, text.as_bytes())?;
        self.runtime
            .log()
            .debug(format!("Wrote environment snapshot {}", path.display()));
        Ok(())
    }

    pub fn collect_outputs(&mut self) -> Result<Vec<PathBuf>, JobExit> {
        let staged = collect::collect_outputs(
            self.runtime,
            self.descriptor,
            &self.dataset,
            &self.work_dir(),
            self.paths,
            &self.target,
        )?;
        self.state = JobState::OutputsCollected;
        Ok(staged)
    }
}

fn basenames(files: &[PathBuf]) -> Vec<String> {
    files.iter().map(|file| util::file_name_str(file)).collect()
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
