//! Product collection and egress.
//!
//! Products are always staged under `outputs/<group>/<dataset>/` so later
//! steps (previews, the status manifest, archive bundling) see one layout no
//! matter where the job's output uri points.
use super::descriptor::{Descriptor, ENV_SNAPSHOT_SUFFIX};
use crate::dataset::DatasetId;
use crate::exit_codes::ExitCode;
use crate::locator::OutputTarget;
use crate::log::Level;
use crate::paths::JobPaths;
use crate::sysexit::{JobExit, Runtime};
use crate::util;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

fn is_env_snapshot(path: &Path) -> bool {
    util::file_name_str(path).ends_with(ENV_SNAPSHOT_SUFFIX)
}

/// Where a collected product is staged locally.
pub fn staged_path(paths: &JobPaths, dataset: &DatasetId, product: &Path) -> PathBuf {
    let dir = if is_env_snapshot(product) {
        paths.env_dir(dataset)
    } else {
        paths.output_dir(dataset)
    };
    dir.join(util::file_name_str(product))
}

/// Scan `work_dir` for products, drop deletable ones, stage the rest, and
/// copy them to a local output target.
///
/// Running it again on an unchanged work directory yields the same staged
/// set.
pub fn collect_outputs(
    runtime: &Runtime<'_>,
    descriptor: &Descriptor,
    dataset: &DatasetId,
    work_dir: &Path,
    paths: &JobPaths,
    target: &OutputTarget,
) -> Result<Vec<PathBuf>, JobExit> {
    let log = runtime.log();
    let staged = runtime.guard(
        ExitCode::GenericError,
        format!("Collecting outputs for {dataset} FAILED."),
        || {
            let patterns = descriptor.output_patterns(dataset);
            let found = util::find_matching(work_dir, &patterns)?;
            let doomed: Vec<&PathBuf> = found
                .iter()
                .filter(|path| descriptor.should_delete(&util::file_name_str(path)))
                .collect();
            if !doomed.is_empty() {
                log.divider(Level::Info, &format!("{dataset} Deleting files"));
                for path in doomed {
                    log.info(format!("Deleting {}", util::display_path(path, Some(work_dir))));
                    remove_if_present(path)?;
                }
            }
            let products = util::find_matching(work_dir, &patterns)?;
            let mut staged = Vec::with_capacity(products.len());
            for product in &products {
                let dest = staged_path(paths, dataset, product);
                if dest != *product {
                    util::copy_atomic(product, &dest)?;
                }
                staged.push(dest);
            }
            staged.sort();
            log.info(format!(
                "Staged {} products under {}",
                staged.len(),
                util::display_path(&paths.output_dir(dataset), Some(paths.root()))
            ));
            Ok(staged)
        },
    )?;

    match target {
        OutputTarget::None => {
            log.info("Output uri is none; skipping egress.");
        }
        OutputTarget::Local(dir) => {
            runtime.guard(
                ExitCode::S3UploadError,
                format!("Saving outputs to {} FAILED.", dir.display()),
                || {
                    log.divider(Level::Info, &format!("{dataset} Saving outputs"));
                    copy_tree(&paths.output_dir(dataset), dir, &staged)?;
                    Ok(())
                },
            )?;
        }
        OutputTarget::ObjectStore(location) => {
            log.info(format!(
                "Products for {dataset} are bundled and uploaded to {location} at finalization."
            ));
        }
    }
    Ok(staged)
}

/// Copy `files` (all under `base`) to the same relative paths under `dest`.
pub fn copy_tree(base: &Path, dest: &Path, files: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut copied = Vec::with_capacity(files.len());
    for file in files {
        let rel = file
            .strip_prefix(base)
            .with_context(|| format!("{} is outside {}", file.display(), base.display()))?;
        let target = dest.join(rel);
        util::copy_atomic(file, &target)?;
        copied.push(target);
    }
    Ok(copied)
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}
