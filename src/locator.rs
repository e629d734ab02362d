//! Input and output locations for a job.
//!
//! Inputs come from a remote query (`astroquery:`), an archive in object
//! storage (`s3://bucket/prefix`), or a local directory (`file:<path>`,
//! also spelled `local:<path>`). Outputs go to object storage, a local
//! directory, or nowhere (`none`).
use crate::archive;
use crate::dataset::DatasetId;
use crate::exit_codes::ExitCode;
use crate::paths::JobPaths;
use crate::storage::{ObjectStore, S3Location};
use crate::sysexit::{JobExit, Runtime};
use crate::util;
use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LocatorError {
    #[error("unsupported {role} uri {uri:?}: expected astroquery:, s3://, file:, or none")]
    UnsupportedScheme { role: &'static str, uri: String },
    #[error("{role} uri {uri:?} names no path")]
    EmptyPath { role: &'static str, uri: String },
    #[error("input uri cannot be none")]
    NoneInput,
    #[error("invalid object storage uri {uri:?}: {reason}")]
    BadObjectStore { uri: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputUri {
    /// Retrieve by remote query; mosaics read their poller file from
    /// `poller` when given.
    Astroquery { poller: Option<S3Location> },
    ObjectStore(S3Location),
    Local(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputUri {
    None,
    ObjectStore(S3Location),
    Local(PathBuf),
}

fn parse_s3(uri: &str) -> Result<S3Location, LocatorError> {
    S3Location::parse(uri).map_err(|err| LocatorError::BadObjectStore {
        uri: uri.to_string(),
        reason: err.to_string(),
    })
}

fn local_path(role: &'static str, uri: &str) -> Option<Result<PathBuf, LocatorError>> {
    let rest = ["file://", "file:", "local://", "local:"]
        .iter()
        .find_map(|prefix| uri.strip_prefix(prefix))?;
    if rest.is_empty() {
        return Some(Err(LocatorError::EmptyPath {
            role,
            uri: uri.to_string(),
        }));
    }
    Some(Ok(PathBuf::from(rest)))
}

impl FromStr for InputUri {
    type Err = LocatorError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let uri = uri.trim();
        if uri.eq_ignore_ascii_case("none") {
            return Err(LocatorError::NoneInput);
        }
        if let Some(rest) = uri.strip_prefix("astroquery") {
            let rest = rest.strip_prefix(':').unwrap_or(rest);
            if rest.starts_with("s3://") {
                return Ok(InputUri::Astroquery {
                    poller: Some(parse_s3(rest)?),
                });
            }
            if rest.trim_matches('/').is_empty() {
                return Ok(InputUri::Astroquery { poller: None });
            }
            return Err(LocatorError::UnsupportedScheme {
                role: "input",
                uri: uri.to_string(),
            });
        }
        if uri.starts_with("s3://") {
            return Ok(InputUri::ObjectStore(parse_s3(uri)?));
        }
        if let Some(path) = local_path("input", uri) {
            return path.map(InputUri::Local);
        }
        Err(LocatorError::UnsupportedScheme {
            role: "input",
            uri: uri.to_string(),
        })
    }
}

impl FromStr for OutputUri {
    type Err = LocatorError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let uri = uri.trim();
        if uri.eq_ignore_ascii_case("none") {
            return Ok(OutputUri::None);
        }
        if uri.starts_with("s3://") {
            return Ok(OutputUri::ObjectStore(parse_s3(uri)?));
        }
        if let Some(path) = local_path("output", uri) {
            return path.map(OutputUri::Local);
        }
        Err(LocatorError::UnsupportedScheme {
            role: "output",
            uri: uri.to_string(),
        })
    }
}

impl fmt::Display for InputUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputUri::Astroquery { poller: None } => f.write_str("astroquery:"),
            InputUri::Astroquery {
                poller: Some(location),
            } => write!(f, "astroquery:{location}"),
            InputUri::ObjectStore(location) => write!(f, "{location}"),
            InputUri::Local(path) => write!(f, "file:{}", path.display()),
        }
    }
}

impl fmt::Display for OutputUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputUri::None => f.write_str("none"),
            OutputUri::ObjectStore(location) => write!(f, "{location}"),
            OutputUri::Local(path) => write!(f, "file:{}", path.display()),
        }
    }
}

/// Where one dataset's products are sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    None,
    Local(PathBuf),
    ObjectStore(S3Location),
}

impl OutputTarget {
    pub fn is_none(&self) -> bool {
        matches!(self, OutputTarget::None)
    }
}

impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputTarget::None => f.write_str("none"),
            OutputTarget::Local(path) => write!(f, "{}", path.display()),
            OutputTarget::ObjectStore(location) => write!(f, "{location}"),
        }
    }
}

/// Destination for `dataset`, qualified by its instrument or mosaic kind.
pub fn resolve_output_path(output: &OutputUri, dataset: &DatasetId) -> OutputTarget {
    let group = dataset.kind().output_group();
    match output {
        OutputUri::None => OutputTarget::None,
        OutputUri::Local(dir) => OutputTarget::Local(dir.join(group).join(dataset.as_str())),
        OutputUri::ObjectStore(location) => {
            OutputTarget::ObjectStore(location.join(group).join(dataset.as_str()))
        }
    }
}

/// Local directory holding `dataset`'s inputs, created when it is fetched.
///
/// Local inputs are used in place; association members must already be
/// co-located there.
pub fn resolve_input_path(
    input: &InputUri,
    dataset: &DatasetId,
    paths: &JobPaths,
) -> Result<PathBuf> {
    match input {
        InputUri::Local(path) => std::path::absolute(path)
            .with_context(|| format!("resolve input directory {}", path.display())),
        InputUri::Astroquery { .. } | InputUri::ObjectStore(_) => {
            let dir = paths.input_dir(dataset);
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
            Ok(dir)
        }
    }
}

/// Object key of `dataset`'s input archive under `prefix`.
pub fn archive_location(prefix: &S3Location, dataset: &DatasetId) -> S3Location {
    prefix.join(&format!("{}.tar.gz", dataset.as_str()))
}

/// Download, unpack, and remove `dataset`'s input archive, returning the
/// unpacked files that match `patterns`.
///
/// Download failures and extraction failures get distinct codes. Members are
/// flattened into `dest` so association members end up co-located.
pub fn fetch_archive(
    runtime: &Runtime<'_>,
    store: &dyn ObjectStore,
    prefix: &S3Location,
    dataset: &DatasetId,
    dest: &Path,
    patterns: &[String],
) -> Result<Vec<PathBuf>, JobExit> {
    let source = archive_location(prefix, dataset);
    let tarball = dest.join(source.file_name());
    runtime.guard(
        ExitCode::S3DownloadError,
        format!("Download of {source} FAILED."),
        || {
            runtime
                .log()
                .info(format!("Downloading {source} to {}", tarball.display()));
            store.get(&source, &tarball)
        },
    )?;
    runtime.guard(
        ExitCode::InputTarFileError,
        format!("Extraction of {} FAILED.", tarball.display()),
        || {
            let staging = tempfile::Builder::new()
                .prefix(".extract-")
                .tempdir_in(dest)
                .with_context(|| format!("create extraction dir in {}", dest.display()))?;
            archive::extract(&tarball, staging.path())?;
            flatten_into(staging.path(), dest)?;
            fs::remove_file(&tarball)
                .with_context(|| format!("remove {}", tarball.display()))?;
            let files = util::find_matching(dest, patterns)?;
            runtime.log().info(format!(
                "Extracted {} input files from {}",
                files.len(),
                source.file_name()
            ));
            Ok(files)
        },
    )
}

fn flatten_into(staging: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(staging).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", staging.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let target = dest.join(entry.file_name());
        fs::rename(entry.path(), &target)
            .with_context(|| format!("move {} into {}", entry.path().display(), dest.display()))?;
    }
    Ok(())
}
