//! Status records for one dataset job.
//!
//! A dataset always has exactly one live marker file under `messages/`:
//! `submit-<id>`, `processing-<id>`, `processed-<id>.trigger`, or
//! `error-<id>`. A transition writes the new marker before removing the old
//! one. Object-storage jobs mirror each marker under `messages/` of the
//! output bucket once the local transition is complete, so a failed mirror
//! leaves the new state live locally.
use crate::log::JobLog;
use crate::paths::JobPaths;
use crate::storage::{ObjectStore, S3Location};
use crate::util;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const TRIGGER_SUFFIX: &str = ".trigger";
const EXIT_STATUS_KEY: &str = "Exit status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Submit,
    Processing,
    Processed,
    Error,
}

impl Status {
    pub const ALL: [Status; 4] = [
        Status::Submit,
        Status::Processing,
        Status::Processed,
        Status::Error,
    ];

    pub fn prefix(self) -> &'static str {
        match self {
            Status::Submit => "submit",
            Status::Processing => "processing",
            Status::Processed => "processed",
            Status::Error => "error",
        }
    }

    /// Marker file name for `dataset` in this state.
    pub fn marker_name(self, dataset: &str) -> String {
        match self {
            Status::Processed => format!("{}-{dataset}{TRIGGER_SUFFIX}", self.prefix()),
            _ => format!("{}-{dataset}", self.prefix()),
        }
    }

    /// Split a marker file name into its state and dataset.
    pub fn parse_marker(name: &str) -> Option<(Status, String)> {
        Status::ALL.into_iter().find_map(|status| {
            let rest = name.strip_prefix(status.prefix())?.strip_prefix('-')?;
            let dataset = match status {
                Status::Processed => rest.strip_suffix(TRIGGER_SUFFIX)?,
                _ => rest,
            };
            (!dataset.is_empty()).then(|| (status, dataset.to_string()))
        })
    }

    fn allows(from: Option<Status>, to: Status) -> bool {
        matches!(
            (from, to),
            (None, Status::Submit)
                | (Some(Status::Submit), Status::Processing)
                | (Some(Status::Submit), Status::Error)
                | (Some(Status::Processing), Status::Processed)
                | (Some(Status::Processing), Status::Error)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

fn describe(status: &Option<Status>) -> &'static str {
    status.map(Status::prefix).unwrap_or("no status")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("cannot move {dataset} from {} to {to}", describe(.from))]
    InvalidTransition {
        dataset: String,
        from: Option<Status>,
        to: Status,
    },
    #[error("no status record for {dataset} in {dir}")]
    NoRecord { dataset: String, dir: String },
}

/// Where markers are mirrored for object-storage jobs.
#[derive(Clone, Copy)]
pub struct RemoteMirror<'a> {
    pub store: &'a dyn ObjectStore,
    pub prefix: &'a S3Location,
}

/// `messages/` at the root of the bucket holding `output`.
pub fn remote_messages_prefix(output: &S3Location) -> Result<S3Location> {
    S3Location::parse(&format!("s3://{}/messages", output.bucket()))
}

pub struct Messenger<'a> {
    dataset: String,
    paths: &'a JobPaths,
    remote: Option<RemoteMirror<'a>>,
    log: &'a JobLog,
    current: Option<Status>,
}

impl<'a> Messenger<'a> {
    pub fn new(
        dataset: &str,
        paths: &'a JobPaths,
        remote: Option<RemoteMirror<'a>>,
        log: &'a JobLog,
    ) -> Self {
        Self {
            dataset: dataset.to_string(),
            paths,
            remote,
            log,
            current: None,
        }
    }

    pub fn current(&self) -> Option<Status> {
        self.current
    }

    /// Publish `submit`, replacing any stale markers for the dataset.
    pub fn init(&mut self) -> Result<()> {
        self.current = None;
        self.transition(Status::Submit, &[])
    }

    /// Pick up the live marker left by an earlier invocation, falling back
    /// to the remote mirror when the local records are gone.
    pub fn resume(&mut self) -> Result<Status> {
        let mut live = self.live_statuses()?;
        if live.is_empty() {
            live = self.mirrored_statuses()?;
        }
        let status = live.last().copied().ok_or_else(|| MessageError::NoRecord {
            dataset: self.dataset.clone(),
            dir: self.paths.messages_dir().display().to_string(),
        })?;
        self.current = Some(status);
        Ok(status)
    }

    /// `submit` to `processing`.
    pub fn process_message(&mut self) -> Result<()> {
        self.transition(Status::Processing, &[])
    }

    /// Decide `processed` or `error` from the phase metrics files.
    ///
    /// A missing preview metrics file counts as success, a missing process
    /// metrics file as failure. `manifest` lines go into the processed
    /// marker.
    pub fn final_message(&mut self, manifest: &[String]) -> Result<Status> {
        if self.current != Some(Status::Processing) {
            return Err(MessageError::InvalidTransition {
                dataset: self.dataset.clone(),
                from: self.current,
                to: Status::Processed,
            }
            .into());
        }
        let process = read_exit_status(&self.paths.process_metrics_path(), 1, self.log)?;
        let preview = read_exit_status(&self.paths.preview_metrics_path(), 0, self.log)?;
        self.log.info(format!(
            "Exit status for {}: process={process} preview={preview}",
            self.dataset
        ));
        if process + preview == 0 {
            self.transition(Status::Processed, manifest)?;
            Ok(Status::Processed)
        } else {
            self.transition(Status::Error, &[])?;
            Ok(Status::Error)
        }
    }

    /// Move straight to `error` from `submit` or `processing`.
    pub fn error_message(&mut self) -> Result<()> {
        self.transition(Status::Error, &[])
    }

    fn transition(&mut self, to: Status, lines: &[String]) -> Result<()> {
        if !Status::allows(self.current, to) {
            return Err(MessageError::InvalidTransition {
                dataset: self.dataset.clone(),
                from: self.current,
                to,
            }
            .into());
        }
        let name = to.marker_name(&self.dataset);
        let mut text = name.clone();
        text.push('\n');
        for line in lines {
            text.push_str(line);
            text.push('\n');
        }
        let path = self.paths.marker_path(&name);
        util::write_atomic(&path, text.as_bytes())?;
        self.log.info(format!("Status for {}: {name}", self.dataset));
        let stale: Vec<Status> = Status::ALL
            .into_iter()
            .filter(|status| *status != to)
            .collect();
        for status in &stale {
            self.remove_local_marker(*status)?;
        }
        self.current = Some(to);
        if let Some(remote) = self.remote {
            let target = remote.prefix.join(&name);
            remote
                .store
                .put(&path, &target, &|_: u64| {})
                .with_context(|| format!("mirror status record to {target}"))?;
            for status in stale {
                let target = remote.prefix.join(&status.marker_name(&self.dataset));
                if let Err(err) = remote.store.delete(&target) {
                    self.log
                        .warning(format!("Could not remove {target}: {err:#}"));
                }
            }
        }
        Ok(())
    }

    fn remove_local_marker(&self, status: Status) -> Result<()> {
        let path = self.paths.marker_path(&status.marker_name(&self.dataset));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
        }
    }

    fn mirrored_statuses(&self) -> Result<Vec<Status>> {
        let Some(remote) = self.remote else {
            return Ok(Vec::new());
        };
        let mut statuses: Vec<Status> = remote
            .store
            .list(remote.prefix)?
            .iter()
            .filter_map(|location| Status::parse_marker(location.file_name()))
            .filter(|(_, dataset)| *dataset == self.dataset)
            .map(|(status, _)| status)
            .collect();
        statuses.sort_by_key(|status| status_rank(*status));
        Ok(statuses)
    }

    /// Live local markers for this dataset, in lifecycle order.
    pub fn live_statuses(&self) -> Result<Vec<Status>> {
        Ok(list_markers(&self.paths.messages_dir())?
            .into_iter()
            .filter(|marker| marker.dataset == self.dataset)
            .map(|marker| marker.status)
            .collect())
    }
}

/// One marker file under `messages/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Marker {
    pub name: String,
    pub status: Status,
    pub dataset: String,
}

/// Markers in `dir`, ordered by dataset then lifecycle; other files are
/// ignored.
pub fn list_markers(dir: &Path) -> Result<Vec<Marker>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    let mut markers = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some((status, dataset)) = Status::parse_marker(&name) {
            markers.push(Marker {
                name,
                status,
                dataset,
            });
        }
    }
    markers.sort_by(|a, b| {
        a.dataset
            .cmp(&b.dataset)
            .then_with(|| status_rank(a.status).cmp(&status_rank(b.status)))
    });
    Ok(markers)
}

fn status_rank(status: Status) -> usize {
    Status::ALL
        .iter()
        .position(|candidate| *candidate == status)
        .unwrap_or(Status::ALL.len())
}

/// Write a phase metrics file ending in the phase's exit status digit.
pub fn write_metrics(path: &Path, dataset: &str, elapsed: Duration, success: bool) -> Result<()> {
    let text = format!(
        "Dataset: {dataset}\nElapsed seconds: {:.3}\n{EXIT_STATUS_KEY}: {}\n",
        elapsed.as_secs_f64(),
        u8::from(!success)
    );
    util::write_atomic(path, text.as_bytes())
}

/// Trailing exit status digit of a metrics file, or `missing` when the file
/// does not exist. A file without a trailing digit counts as a failure.
pub fn read_exit_status(path: &Path, missing: u32, log: &JobLog) -> Result<u32> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            log.debug(format!("{} not found; counting it as {missing}", path.display()));
            return Ok(missing);
        }
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    match text.trim_end().chars().last().and_then(|ch| ch.to_digit(10)) {
        Some(digit) => Ok(digit),
        None => {
            log.warning(format!(
                "{} has no trailing exit status; counting it as a failure",
                path.display()
            ));
            Ok(1)
        }
    }
}

/// Manifest lines for a processed marker: staged products relative to the
/// job root, or the archive that holds them.
pub fn manifest_lines(paths: &JobPaths, staged: &[PathBuf]) -> Vec<String> {
    staged
        .iter()
        .map(|path| {
            paths
                .rel_path(path)
                .unwrap_or_else(|| path.display().to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsObjectStore;

    fn live(paths: &JobPaths, dataset: &str) -> Vec<String> {
        list_markers(&paths.messages_dir())
            .expect("list")
            .into_iter()
            .filter(|marker| marker.dataset == dataset)
            .map(|marker| marker.name)
            .collect()
    }

    #[test]
    fn marker_names_round_trip() {
        assert_eq!(Status::Processed.marker_name("J8CB010B0"), "processed-J8CB010B0.trigger");
        assert_eq!(
            Status::parse_marker("processed-J8CB010B0.trigger"),
            Some((Status::Processed, "J8CB010B0".to_string()))
        );
        assert_eq!(
            Status::parse_marker("error-acs_8ph_01"),
            Some((Status::Error, "acs_8ph_01".to_string()))
        );
        assert_eq!(Status::parse_marker("processed-J8CB010B0"), None);
        assert_eq!(Status::parse_marker("submit-"), None);
        assert_eq!(Status::parse_marker("notes.txt"), None);
    }

    #[test]
    fn exactly_one_marker_after_every_transition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = JobPaths::new(dir.path().to_path_buf());
        let log = JobLog::capturing();
        fs::create_dir_all(paths.messages_dir()).expect("mkdir");
        fs::write(paths.marker_path("error-J8CB010B0"), "stale").expect("stale marker");
        fs::write(paths.marker_path("submit-IC0B02020"), "other job").expect("other marker");

        let mut messenger = Messenger::new("J8CB010B0", &paths, None, &log);
        messenger.init().expect("init");
        assert_eq!(live(&paths, "J8CB010B0"), vec!["submit-J8CB010B0"]);
        messenger.process_message().expect("processing");
        assert_eq!(live(&paths, "J8CB010B0"), vec!["processing-J8CB010B0"]);

        write_metrics(&paths.process_metrics_path(), "J8CB010B0", Duration::from_secs(3), true)
            .expect("metrics");
        let manifest = vec!["outputs/acs/j8cb010b0/j8cb010b0_drz.fits".to_string()];
        let status = messenger.final_message(&manifest).expect("final");
        assert_eq!(status, Status::Processed);
        assert_eq!(live(&paths, "J8CB010B0"), vec!["processed-J8CB010B0.trigger"]);
        assert_eq!(live(&paths, "IC0B02020"), vec!["submit-IC0B02020"]);
        let text = fs::read_to_string(paths.marker_path("processed-J8CB010B0.trigger"))
            .expect("marker");
        assert_eq!(
            text,
            "processed-J8CB010B0.trigger\noutputs/acs/j8cb010b0/j8cb010b0_drz.fits\n"
        );
    }

    #[test]
    fn failing_metrics_produce_error_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = JobPaths::new(dir.path().to_path_buf());
        let log = JobLog::capturing();
        let mut messenger = Messenger::new("J8CB010B0", &paths, None, &log);
        messenger.init().expect("init");
        messenger.process_message().expect("processing");
        write_metrics(&paths.process_metrics_path(), "J8CB010B0", Duration::ZERO, true)
            .expect("process metrics");
        write_metrics(&paths.preview_metrics_path(), "J8CB010B0", Duration::ZERO, false)
            .expect("preview metrics");
        assert_eq!(messenger.final_message(&[]).expect("final"), Status::Error);
        assert_eq!(live(&paths, "J8CB010B0"), vec!["error-J8CB010B0"]);
    }

    #[test]
    fn missing_process_metrics_counts_as_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = JobPaths::new(dir.path().to_path_buf());
        let log = JobLog::capturing();
        let mut messenger = Messenger::new("O8JE01010", &paths, None, &log);
        messenger.init().expect("init");
        messenger.process_message().expect("processing");
        assert_eq!(messenger.final_message(&[]).expect("final"), Status::Error);
    }

    #[test]
    fn final_message_requires_processing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = JobPaths::new(dir.path().to_path_buf());
        let log = JobLog::capturing();
        let mut messenger = Messenger::new("J8CB010B0", &paths, None, &log);
        messenger.init().expect("init");
        let err = messenger.final_message(&[]).expect_err("still submitted");
        assert_eq!(
            err.downcast_ref::<MessageError>(),
            Some(&MessageError::InvalidTransition {
                dataset: "J8CB010B0".to_string(),
                from: Some(Status::Submit),
                to: Status::Processed,
            })
        );
        assert_eq!(live(&paths, "J8CB010B0"), vec!["submit-J8CB010B0"]);
    }

    #[test]
    fn resume_picks_up_processing_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = JobPaths::new(dir.path().to_path_buf());
        let log = JobLog::capturing();
        let mut first = Messenger::new("J8CB010B0", &paths, None, &log);
        first.init().expect("init");
        first.process_message().expect("processing");

        let mut second = Messenger::new("J8CB010B0", &paths, None, &log);
        assert_eq!(second.resume().expect("resume"), Status::Processing);
        let mut missing = Messenger::new("IC0B02020", &paths, None, &log);
        assert!(missing.resume().is_err());
    }

    #[test]
    fn markers_are_mirrored_and_old_ones_removed_remotely() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = JobPaths::new(dir.path().join("job"));
        let store = FsObjectStore::new(dir.path().join("buckets"));
        let output = S3Location::parse("s3://calibrated/batch-7/acs/J8CB010B0").expect("s3");
        let prefix = remote_messages_prefix(&output).expect("prefix");
        assert_eq!(prefix.to_string(), "s3://calibrated/messages");
        let log = JobLog::capturing();
        let mut messenger = Messenger::new(
            "J8CB010B0",
            &paths,
            Some(RemoteMirror {
                store: &store,
                prefix: &prefix,
            }),
            &log,
        );
        messenger.init().expect("init");
        messenger.process_message().expect("processing");
        let remote: Vec<String> = store
            .list(&prefix)
            .expect("list")
            .iter()
            .map(|location| location.file_name().to_string())
            .collect();
        assert_eq!(remote, vec!["processing-J8CB010B0"]);

        fs::remove_dir_all(paths.messages_dir()).expect("drop local records");
        let mut resumed = Messenger::new(
            "J8CB010B0",
            &paths,
            Some(RemoteMirror {
                store: &store,
                prefix: &prefix,
            }),
            &log,
        );
        assert_eq!(resumed.resume().expect("resume"), Status::Processing);
    }

    /// Refuses uploads of `processing` records.
    struct RefusingStore(FsObjectStore);

    impl ObjectStore for RefusingStore {
        fn get(&self, source: &S3Location, dest: &Path) -> Result<()> {
            self.0.get(source, dest)
        }

        fn put(&self, source: &Path, dest: &S3Location, progress: &dyn Fn(u64)) -> Result<()> {
            if dest.file_name().starts_with("processing") {
                anyhow::bail!("503 Slow Down");
            }
            self.0.put(source, dest, progress)
        }

        fn delete(&self, target: &S3Location) -> Result<bool> {
            self.0.delete(target)
        }

        fn list(&self, prefix: &S3Location) -> Result<Vec<S3Location>> {
            self.0.list(prefix)
        }
    }

    #[test]
    fn failed_mirror_still_leaves_one_live_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = JobPaths::new(dir.path().join("job"));
        let store = RefusingStore(FsObjectStore::new(dir.path().join("buckets")));
        let prefix = S3Location::parse("s3://calibrated/messages").expect("prefix");
        let log = JobLog::capturing();
        let mut messenger = Messenger::new(
            "J8CB010B0",
            &paths,
            Some(RemoteMirror {
                store: &store,
                prefix: &prefix,
            }),
            &log,
        );
        messenger.init().expect("init");
        assert!(messenger.process_message().is_err());
        assert_eq!(live(&paths, "J8CB010B0"), vec!["processing-J8CB010B0"]);
        assert_eq!(messenger.current(), Some(Status::Processing));

        messenger.error_message().expect("error record");
        assert_eq!(live(&paths, "J8CB010B0"), vec!["error-J8CB010B0"]);
        let remote: Vec<String> = store
            .list(&prefix)
            .expect("list")
            .iter()
            .map(|location| location.file_name().to_string())
            .collect();
        assert_eq!(remote, vec!["error-J8CB010B0"]);
    }

    #[test]
    fn metrics_trailing_digit_is_the_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = JobLog::capturing();
        let path = dir.path().join("process_metrics.txt");
        write_metrics(&path, "J8CB010B0", Duration::from_millis(1500), false).expect("write");
        let text = fs::read_to_string(&path).expect("read");
        assert_eq!(
            text,
            "Dataset: J8CB010B0\nElapsed seconds: 1.500\nExit status: 1\n"
        );
        assert_eq!(read_exit_status(&path, 0, &log).expect("status"), 1);
        assert_eq!(
            read_exit_status(&dir.path().join("absent.txt"), 0, &log).expect("status"),
            0
        );
        fs::write(&path, "garbled").expect("write");
        assert_eq!(read_exit_status(&path, 0, &log).expect("status"), 1);
    }
}
