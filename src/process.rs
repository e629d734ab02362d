//! Dataset job orchestration: status records around a pipeline run, phase
//! metrics, and finalization.
use crate::archive::{self, ArchiveEntry};
use crate::config::Settings;
use crate::dataset::DatasetId;
use crate::exit_codes::ExitCode;
use crate::locator::{self, InputUri, OutputTarget, OutputUri};
use crate::log::{JobLog, Level};
use crate::messages::{self, Messenger, RemoteMirror, Status};
use crate::paths::JobPaths;
use crate::pipeline::{collect, Collaborators, PipelineManager};
use crate::storage::{S3Location, UploadProgress};
use crate::sysexit::{JobExit, Runtime};
use crate::util;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Job-root files delivered with the products.
const LOG_PATTERNS: [&str; 2] = ["process*.txt", "preview*.txt"];
const LOGS_DIR: &str = "logs";

/// Everything a dataset job needs besides its uris.
pub struct JobContext<'a> {
    pub runtime: &'a Runtime<'a>,
    pub paths: &'a JobPaths,
    pub settings: &'a Settings,
    pub collaborators: Collaborators<'a>,
}

impl<'a> JobContext<'a> {
    /// Process each dataset in turn, stopping at the first failure.
    pub fn process_datasets(
        &self,
        input: &InputUri,
        output: &OutputUri,
        datasets: &[String],
        defer_finalize: bool,
    ) -> Result<(), JobExit> {
        for id in datasets {
            self.process_one(input, output, id, defer_finalize)?;
        }
        Ok(())
    }

    /// Run one dataset from `submit` to its final status record.
    ///
    /// On failure the error record is still written and the pipeline's code
    /// is returned, even if finalization fails as well.
    pub fn process_one(
        &self,
        input: &InputUri,
        output: &OutputUri,
        id: &str,
        defer_finalize: bool,
    ) -> Result<(), JobExit> {
        let runtime = self.runtime;
        let log = runtime.log();
        log.reset_memory_error();
        let dataset = runtime.guard(
            ExitCode::CmdlineError,
            format!("Invalid dataset id {id:?}."),
            || Ok(DatasetId::parse(id)?),
        )?;
        let mut manager = runtime.guard(
            ExitCode::CmdlineError,
            format!("No pipeline for {dataset}."),
            || {
                Ok(PipelineManager::new(
                    dataset.clone(),
                    input,
                    output,
                    self.paths,
                    self.settings,
                    runtime,
                    self.collaborators,
                )?)
            },
        )?;

        let target = manager.target();
        if target.is_none() {
            log.info(format!(
                "{dataset} runs the {} pipeline; outputs stay in {}",
                manager.descriptor().name,
                self.paths.output_dir(&dataset).display()
            ));
        } else {
            log.info(format!(
                "{dataset} runs the {} pipeline; outputs go to {target}",
                manager.descriptor().name
            ));
        }

        let mirror_prefix = self.mirror_prefix(output)?;
        let mut messenger = Messenger::new(
            dataset.as_str(),
            self.paths,
            self.mirror(mirror_prefix.as_ref()),
            log,
        );
        let published = runtime.guard(
            ExitCode::GenericError,
            format!("Status records for {dataset} FAILED."),
            || {
                remove_if_present(&self.paths.preview_metrics_path())?;
                messenger.init()?;
                messenger.process_message()
            },
        );
        if let Err(exit) = published {
            if messenger.current().is_some() {
                record_error(&mut messenger, log);
            }
            return Err(exit);
        }

        let started = Instant::now();
        let outcome = manager.run();
        let elapsed = started.elapsed();
        log.info(format!(
            "{dataset} finished in state {:?} after {:.1} seconds",
            manager.state(),
            elapsed.as_secs_f64()
        ));

        match outcome {
            Ok(_) => {
                runtime.guard(
                    ExitCode::GenericError,
                    format!("Writing process metrics for {dataset} FAILED."),
                    || {
                        messages::write_metrics(
                            &self.paths.process_metrics_path(),
                            dataset.as_str(),
                            elapsed,
                            true,
                        )
                    },
                )?;
                if defer_finalize {
                    log.info(format!(
                        "Leaving {dataset} in processing for the preview step."
                    ));
                    return Ok(());
                }
                let status = self.finalize_dataset(input, output, &dataset, &mut messenger)?;
                status_exit(status)
            }
            Err(exit) => {
                if let Err(err) = messages::write_metrics(
                    &self.paths.process_metrics_path(),
                    dataset.as_str(),
                    elapsed,
                    false,
                ) {
                    log.warning(format!("Could not write process metrics: {err:#}"));
                }
                if self
                    .finalize_dataset(input, output, &dataset, &mut messenger)
                    .is_err()
                {
                    log.warning(format!(
                        "Finalization of {dataset} also failed; keeping {}",
                        exit.code()
                    ));
                    if messenger.current() == Some(Status::Processing) {
                        record_error(&mut messenger, log);
                    }
                }
                Err(exit)
            }
        }
    }

    /// Finalize a dataset whose processing was deferred.
    pub fn finalize(
        &self,
        input: &InputUri,
        output: &OutputUri,
        id: &str,
    ) -> Result<Status, JobExit> {
        let runtime = self.runtime;
        let dataset = runtime.guard(
            ExitCode::CmdlineError,
            format!("Invalid dataset id {id:?}."),
            || Ok(DatasetId::parse(id)?),
        )?;
        let mirror_prefix = self.mirror_prefix(output)?;
        let mut messenger = Messenger::new(
            dataset.as_str(),
            self.paths,
            self.mirror(mirror_prefix.as_ref()),
            runtime.log(),
        );
        runtime.guard(
            ExitCode::GenericError,
            format!("Resuming status for {dataset} FAILED."),
            || messenger.resume(),
        )?;
        self.finalize_dataset(input, output, &dataset, &mut messenger)
    }

    /// Deliver late artifacts, publish the final status record, and clean
    /// up transient state for object-storage jobs.
    pub fn finalize_dataset(
        &self,
        input: &InputUri,
        output: &OutputUri,
        dataset: &DatasetId,
        messenger: &mut Messenger<'_>,
    ) -> Result<Status, JobExit> {
        let runtime = self.runtime;
        let log = runtime.log();
        log.divider(Level::Info, &format!("{dataset} Finalizing"));
        let target = locator::resolve_output_path(output, dataset);
        let manifest = match self.deliver(input, dataset, &target) {
            Ok(manifest) => manifest,
            Err(exit) => {
                if let Err(err) = self.save_logs(&target) {
                    log.warning(format!("Could not save logs: {err:#}"));
                }
                record_error(messenger, log);
                return Err(exit);
            }
        };
        let saved = runtime.guard(
            ExitCode::S3UploadError,
            format!("Saving logs for {dataset} FAILED."),
            || self.save_logs(&target),
        );
        if let Err(exit) = saved {
            record_error(messenger, log);
            return Err(exit);
        }
        let status = runtime.guard(
            ExitCode::GenericError,
            format!("Final status message for {dataset} FAILED."),
            || messenger.final_message(&manifest),
        )?;
        if let OutputTarget::ObjectStore(_) = target {
            self.cleanup(input, log);
        }
        Ok(status)
    }

    /// Egress whatever collection could not send yet; returns the manifest
    /// lines for the processed record.
    fn deliver(
        &self,
        input: &InputUri,
        dataset: &DatasetId,
        target: &OutputTarget,
    ) -> Result<Vec<String>, JobExit> {
        let output_dir = self.paths.output_dir(dataset);
        let staged = self.runtime.guard(
            ExitCode::GenericError,
            format!("Listing outputs of {dataset} FAILED."),
            || util::collect_files_recursive(&output_dir),
        )?;
        let previews = self.runtime.guard(
            ExitCode::CreatePreviewsError,
            format!("Collecting previews of {dataset} FAILED."),
            || util::collect_files_recursive(&self.paths.previews_dir(dataset)),
        )?;
        match target {
            OutputTarget::None => Ok(messages::manifest_lines(self.paths, &staged)),
            OutputTarget::Local(dir) => {
                let previews = self.runtime.guard(
                    ExitCode::S3UploadError,
                    format!("Saving previews to {} FAILED.", dir.display()),
                    || collect::copy_tree(&output_dir, dir, &previews),
                )?;
                if !previews.is_empty() {
                    self.runtime
                        .log()
                        .info(format!("Saved {} previews to {}", previews.len(), dir.display()));
                }
                Ok(staged
                    .iter()
                    .filter_map(|path| path.strip_prefix(&output_dir).ok())
                    .map(|rel| dir.join(rel).display().to_string())
                    .collect())
            }
            OutputTarget::ObjectStore(location) => {
                let uploaded = self.runtime.guard(
                    ExitCode::S3UploadError,
                    format!("Upload of {dataset} to {location} FAILED."),
                    || self.upload_bundle(input, dataset, &output_dir, &staged, location),
                )?;
                Ok(uploaded.into_iter().map(|dest| dest.to_string()).collect())
            }
        }
    }

    /// Copy the transcript and phase metrics beside the delivered products,
    /// under `logs/` of the output target. Jobs without output keep them in
    /// the job root.
    fn save_logs(&self, target: &OutputTarget) -> Result<()> {
        let log = self.runtime.log();
        let mut files = util::find_matching(self.paths.root(), &LOG_PATTERNS.map(String::from))?;
        if let Some(path) = log.path().filter(|path| path.is_file()) {
            let name = util::file_name_str(path);
            if !files.iter().any(|file| util::file_name_str(file) == name) {
                files.push(path.to_path_buf());
            }
        }
        match target {
            OutputTarget::None => {}
            OutputTarget::Local(dir) => {
                let dest = dir.join(LOGS_DIR);
                for file in &files {
                    let saved = dest.join(util::file_name_str(file));
                    util::copy_atomic(file, &saved)?;
                    log.info(format!("Saved log {}", saved.display()));
                }
            }
            OutputTarget::ObjectStore(location) => {
                let dest = location.join(LOGS_DIR);
                for file in &files {
                    let object = dest.join(&util::file_name_str(file));
                    self.collaborators.store.put(file, &object, &|_: u64| {})?;
                    log.info(format!("Uploaded log {object}"));
                }
            }
        }
        Ok(())
    }

    /// Bundle staged products (or, when there are none, the inputs) and
    /// upload them as `<dataset>.tar.gz`.
    fn upload_bundle(
        &self,
        input: &InputUri,
        dataset: &DatasetId,
        output_dir: &Path,
        staged: &[PathBuf],
        location: &S3Location,
    ) -> Result<Option<S3Location>> {
        let log = self.runtime.log();
        let (base, files) = if staged.is_empty() {
            let input_dir = match input {
                InputUri::Local(dir) => dir.clone(),
                _ => self.paths.input_dir(dataset),
            };
            let files = util::collect_files_recursive(&input_dir)?;
            if !files.is_empty() {
                log.info(format!("No outputs for {dataset}; bundling inputs instead."));
            }
            (input_dir, files)
        } else {
            (output_dir.to_path_buf(), staged.to_vec())
        };
        if files.is_empty() {
            log.warning(format!("Nothing to upload for {dataset}."));
            return Ok(None);
        }
        let entries = files
            .iter()
            .map(|file| {
                let rel = file
                    .strip_prefix(&base)
                    .with_context(|| format!("{} is outside {}", file.display(), base.display()))?;
                Ok(ArchiveEntry {
                    source: file.clone(),
                    name: rel.to_string_lossy().replace('\\', "/"),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let scratch = tempfile::Builder::new()
            .prefix(".bundle-")
            .tempdir_in(self.paths.root())
            .with_context(|| format!("create bundle dir in {}", self.paths.root().display()))?;
        let name = format!("{}.tar.gz", dataset.as_str());
        let bundle = scratch.path().join(&name);
        archive::create(&bundle, &entries)?;
        let dest = location.join(&name);
        log.info(format!("Uploading {} files as {dest}", entries.len()));
        let progress = UploadProgress::for_file(&bundle)?;
        self.collaborators.store.put(&bundle, &dest, &|bytes: u64| {
            progress.record(bytes);
        })?;
        log.info(format!("Uploaded {} bytes to {dest}", progress.seen()));
        Ok(Some(dest))
    }

    fn cleanup(&self, input: &InputUri, log: &JobLog) {
        let mut doomed = vec![self.paths.outputs_root(), self.paths.messages_dir()];
        if !matches!(input, InputUri::Local(_)) {
            doomed.push(self.paths.inputs_root());
        }
        for dir in doomed {
            if !dir.exists() {
                continue;
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => log.info(format!(
                    "Removed {}",
                    util::display_path(&dir, Some(self.paths.root()))
                )),
                Err(err) => log.warning(format!("Could not remove {}: {err}", dir.display())),
            }
        }
    }

    fn mirror_prefix(&self, output: &OutputUri) -> Result<Option<S3Location>, JobExit> {
        match output {
            OutputUri::ObjectStore(location) => self
                .runtime
                .guard(
                    ExitCode::CmdlineError,
                    format!("Invalid output uri {output}."),
                    || messages::remote_messages_prefix(location),
                )
                .map(Some),
            _ => Ok(None),
        }
    }

    fn mirror<'m>(&self, prefix: Option<&'m S3Location>) -> Option<RemoteMirror<'m>>
    where
        'a: 'm,
    {
        prefix.map(|prefix| RemoteMirror {
            store: self.collaborators.store,
            prefix,
        })
    }
}

fn record_error(messenger: &mut Messenger<'_>, log: &JobLog) {
    if let Err(err) = messenger.error_message() {
        log.warning(format!("Could not record error status: {err:#}"));
    }
}

/// A finalization that wrote an error record fails the job generically.
pub fn status_exit(status: Status) -> Result<(), JobExit> {
    match status {
        Status::Processed => Ok(()),
        _ => Err(JobExit::new(ExitCode::GenericError)),
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

#[cfg(test)]
#[path = "process_tests.rs"]
mod tests;
