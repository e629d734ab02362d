use super::*;
use crate::bestrefs::ReferenceAssigner;
use crate::fits;
use crate::messages::list_markers;
use crate::retrieve::Retriever;
use crate::storage::{FsObjectStore, ObjectStore};
use crate::sysexit::run_job;
use std::time::Duration;

struct NoArchive;

impl Retriever for NoArchive {
    fn retrieve(&self, _dataset: &str, _suffixes: &[&str], _dest: &Path) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    fn fetch(&self, _name: &str, _dest: &Path) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

struct NoopAssigner;

impl ReferenceAssigner for NoopAssigner {
    fn assign(&self, _files: &[PathBuf], _context: Option<&str>, _sync: bool) -> Result<()> {
        Ok(())
    }
}

/// Rejects every upload of a `processing` record.
struct NoProcessingUploads(FsObjectStore);

impl ObjectStore for NoProcessingUploads {
    fn get(&self, source: &S3Location, dest: &Path) -> Result<()> {
        self.0.get(source, dest)
    }

    fn put(&self, source: &Path, dest: &S3Location, progress: &dyn Fn(u64)) -> Result<()> {
        if dest.file_name().starts_with("processing-") {
            anyhow::bail!("connection reset uploading {dest}");
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

fn seed_acs_inputs(dir: &Path) {
    fs::create_dir_all(dir).expect("mkdir");
    for name in ["j8cb010b0_asn.fits", "j8cb01u3q_raw.fits", "j8cb01u8q_raw.fits"] {
        fs::write(dir.join(name), fits::minimal_file(&[], 1).expect("fits")).expect("write");
    }
}

fn marker_names(paths: &JobPaths) -> Vec<String> {
    list_markers(&paths.messages_dir())
        .expect("list")
        .into_iter()
        .map(|marker| marker.name)
        .collect()
}

#[test]
fn stage_failure_leaves_error_record_and_stage_code() {
    let dir = tempfile::tempdir().expect("tempdir");
    let inputs = dir.path().join("incoming");
    seed_acs_inputs(&inputs);
    let paths = JobPaths::new(dir.path().join("job"));
    let settings = Settings::default();
    let log = JobLog::capturing();
    let runtime = Runtime::new(&log, None);
    let store = FsObjectStore::new(dir.path().join("buckets"));
    let context = JobContext {
        runtime: &runtime,
        paths: &paths,
        settings: &settings,
        collaborators: Collaborators {
            retriever: &NoArchive,
            assigner: &NoopAssigner,
            store: &store,
        },
    };

    let exit = context
        .process_datasets(
            &InputUri::Local(inputs),
            &OutputUri::None,
            &["J8CB010B0".to_string()],
            false,
        )
        .expect_err("calacs.e is not installed");
    assert_eq!(exit.code(), ExitCode::Stage1Error);
    assert_eq!(marker_names(&paths), vec!["error-J8CB010B0"]);
    let metrics = fs::read_to_string(paths.process_metrics_path()).expect("metrics");
    assert!(metrics.ends_with("Exit status: 1\n"));
}

#[test]
fn failed_object_storage_job_uploads_its_inputs() {
    let dir = tempfile::tempdir().expect("tempdir");
    let inputs = dir.path().join("incoming");
    seed_acs_inputs(&inputs);
    let paths = JobPaths::new(dir.path().join("job"));
    let settings = Settings::default();
    let log = JobLog::capturing();
    let runtime = Runtime::new(&log, None);
    let store = FsObjectStore::new(dir.path().join("buckets"));
    let context = JobContext {
        runtime: &runtime,
        paths: &paths,
        settings: &settings,
        collaborators: Collaborators {
            retriever: &NoArchive,
            assigner: &NoopAssigner,
            store: &store,
        },
    };
    let output: OutputUri = "s3://calibrated/batch-9".parse().expect("output");

    let exit = context
        .process_one(&InputUri::Local(inputs), &output, "J8CB010B0", false)
        .expect_err("stage fails");
    assert_eq!(exit.code(), ExitCode::Stage1Error);

    let bundle = store.object_path(
        &S3Location::parse("s3://calibrated/batch-9/acs/J8CB010B0/J8CB010B0.tar.gz")
            .expect("s3"),
    );
    assert_eq!(
        archive::list(&bundle).expect("bundle"),
        vec![
            "j8cb010b0_asn.fits",
            "j8cb010b0_cal_env.txt",
            "j8cb01u3q_raw.fits",
            "j8cb01u8q_raw.fits"
        ]
    );
    let remote: Vec<String> = store
        .list(&S3Location::parse("s3://calibrated/messages").expect("s3"))
        .expect("list")
        .iter()
        .map(|location| location.file_name().to_string())
        .collect();
    assert_eq!(remote, vec!["error-J8CB010B0"]);
    assert!(!paths.messages_dir().exists());
    assert!(!paths.outputs_root().exists());
}

#[test]
fn malformed_dataset_is_a_command_line_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = JobPaths::new(dir.path().to_path_buf());
    let settings = Settings::default();
    let log = JobLog::capturing();
    let runtime = Runtime::new(&log, None);
    let store = FsObjectStore::new(dir.path().join("buckets"));
    let context = JobContext {
        runtime: &runtime,
        paths: &paths,
        settings: &settings,
        collaborators: Collaborators {
            retriever: &NoArchive,
            assigner: &NoopAssigner,
            store: &store,
        },
    };
    let input = InputUri::Astroquery { poller: None };

    let exit = context
        .process_one(&input, &OutputUri::None, "not-a-dataset", false)
        .expect_err("malformed");
    assert_eq!(exit.code(), ExitCode::CmdlineError);
    let exit = context
        .process_one(&input, &OutputUri::None, "U8CB010B0", false)
        .expect_err("no wfpc2 pipeline");
    assert_eq!(exit.code(), ExitCode::CmdlineError);
    assert!(marker_names(&paths).is_empty());
}

#[test]
fn finalize_requires_a_live_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = JobPaths::new(dir.path().to_path_buf());
    let settings = Settings::default();
    let log = JobLog::capturing();
    let runtime = Runtime::new(&log, None);
    let store = FsObjectStore::new(dir.path().join("buckets"));
    let context = JobContext {
        runtime: &runtime,
        paths: &paths,
        settings: &settings,
        collaborators: Collaborators {
            retriever: &NoArchive,
            assigner: &NoopAssigner,
            store: &store,
        },
    };
    let exit = context
        .finalize(
            &InputUri::Astroquery { poller: None },
            &OutputUri::None,
            "J8CB010B0",
        )
        .expect_err("nothing to resume");
    assert_eq!(exit.code(), ExitCode::GenericError);
}

#[test]
fn deferred_finalize_delivers_previews_and_lists_products() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = JobPaths::new(dir.path().join("job"));
    let dataset = DatasetId::parse("J8CB010B0").expect("dataset");
    let settings = Settings::default();
    let log = JobLog::capturing();
    let runtime = Runtime::new(&log, None);
    let store = FsObjectStore::new(dir.path().join("buckets"));
    let context = JobContext {
        runtime: &runtime,
        paths: &paths,
        settings: &settings,
        collaborators: Collaborators {
            retriever: &NoArchive,
            assigner: &NoopAssigner,
            store: &store,
        },
    };

    let mut messenger = Messenger::new(dataset.as_str(), &paths, None, &log);
    messenger.init().expect("init");
    messenger.process_message().expect("processing");
    messages::write_metrics(&paths.process_metrics_path(), "J8CB010B0", Duration::ZERO, true)
        .expect("metrics");
    util::write_atomic(&paths.output_dir(&dataset).join("j8cb010b0_drz.fits"), b"drz")
        .expect("product");
    util::write_atomic(&paths.previews_dir(&dataset).join("j8cb010b0_drz.png"), b"png")
        .expect("preview");

    let delivered = dir.path().join("delivered");
    let output = OutputUri::Local(delivered.clone());
    let status = context
        .finalize(&InputUri::Astroquery { poller: None }, &output, "J8CB010B0")
        .expect("finalize");
    assert_eq!(status, Status::Processed);
    assert!(delivered
        .join("acs/J8CB010B0/previews/j8cb010b0_drz.png")
        .is_file());
    assert_eq!(marker_names(&paths), vec!["processed-J8CB010B0.trigger"]);
    let record = fs::read_to_string(paths.marker_path("processed-J8CB010B0.trigger"))
        .expect("record");
    assert!(record.contains(
        &delivered
            .join("acs/J8CB010B0/j8cb010b0_drz.fits")
            .display()
            .to_string()
    ));
}

#[test]
fn status_mirror_failure_ends_in_a_single_error_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let inputs = dir.path().join("incoming");
    seed_acs_inputs(&inputs);
    let paths = JobPaths::new(dir.path().join("job"));
    let settings = Settings::default();
    let log = JobLog::capturing();
    let runtime = Runtime::new(&log, None);
    let store = NoProcessingUploads(FsObjectStore::new(dir.path().join("buckets")));
    let context = JobContext {
        runtime: &runtime,
        paths: &paths,
        settings: &settings,
        collaborators: Collaborators {
            retriever: &NoArchive,
            assigner: &NoopAssigner,
            store: &store,
        },
    };
    let output: OutputUri = "s3://calibrated/batch-9".parse().expect("output");

    let exit = context
        .process_one(&InputUri::Local(inputs), &output, "J8CB010B0", false)
        .expect_err("mirror fails");
    assert_eq!(exit.code(), ExitCode::GenericError);
    assert_eq!(marker_names(&paths), vec!["error-J8CB010B0"]);
    assert!(log
        .captured_lines()
        .iter()
        .any(|line| line.contains("Status records for J8CB010B0 FAILED.")));
}

#[test]
fn earlier_memory_error_does_not_promote_a_later_dataset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths = JobPaths::new(dir.path().to_path_buf());
    let settings = Settings::default();
    let log = JobLog::capturing();
    let store = FsObjectStore::new(dir.path().join("buckets"));
    let code = run_job(&log, || {
        let runtime = Runtime::new(&log, None);
        let context = JobContext {
            runtime: &runtime,
            paths: &paths,
            settings: &settings,
            collaborators: Collaborators {
                retriever: &NoArchive,
                assigner: &NoopAssigner,
                store: &store,
            },
        };
        log.echo("MemoryError: left over from the previous dataset");
        context.process_one(
            &InputUri::Astroquery { poller: None },
            &OutputUri::None,
            "not-a-dataset",
            false,
        )?;
        Ok(())
    });
    assert_eq!(code, ExitCode::CmdlineError);
}
