//! Typed paths into a job's working layout.
//!
//! ```text
//! <root>/inputs/<dataset>/...
//! <root>/outputs/<group>/<dataset>/{previews,env}/...
//! <root>/messages/<marker>
//! <root>/process_metrics.txt
//! <root>/preview_metrics.txt
//! ```
use crate::dataset::DatasetId;
use std::path::{Path, PathBuf};

pub const PROCESS_METRICS_FILE: &str = "process_metrics.txt";
pub const PREVIEW_METRICS_FILE: &str = "preview_metrics.txt";
pub const DEFAULT_LOG_FILE: &str = "process.txt";

#[derive(Debug, Clone)]
pub struct JobPaths {
    root: PathBuf,
}

impl JobPaths {
    /// Create a path helper rooted at the job working directory.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the `inputs/` directory path.
    pub fn inputs_root(&self) -> PathBuf {
        self.root.join("inputs")
    }

    /// Return the `inputs/<dataset>` directory path.
    pub fn input_dir(&self, dataset: &DatasetId) -> PathBuf {
        self.inputs_root().join(dataset.lower())
    }

    /// Return the `outputs/` directory path.
    pub fn outputs_root(&self) -> PathBuf {
        self.root.join("outputs")
    }

    /// Return the `outputs/<group>/<dataset>` directory path.
    pub fn output_dir(&self, dataset: &DatasetId) -> PathBuf {
        self.outputs_root()
            .join(dataset.kind().output_group())
            .join(dataset.lower())
    }

    pub fn previews_dir(&self, dataset: &DatasetId) -> PathBuf {
        self.output_dir(dataset).join("previews")
    }

    pub fn env_dir(&self, dataset: &DatasetId) -> PathBuf {
        self.output_dir(dataset).join("env")
    }

    /// Return the `messages/` directory path.
    pub fn messages_dir(&self) -> PathBuf {
        self.root.join("messages")
    }

    pub fn marker_path(&self, marker: &str) -> PathBuf {
        self.messages_dir().join(marker)
    }

    pub fn process_metrics_path(&self) -> PathBuf {
        self.root.join(PROCESS_METRICS_FILE)
    }

    pub fn preview_metrics_path(&self) -> PathBuf {
        self.root.join(PREVIEW_METRICS_FILE)
    }

    /// Default job transcript path.
    pub fn log_path(&self) -> PathBuf {
        self.root.join(DEFAULT_LOG_FILE)
    }

    /// Return the relative path for `path` under this root, if possible.
    pub fn rel_path(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
    }
}

/// File name of the per-dataset environment snapshot.
pub fn env_snapshot_name(dataset: &DatasetId) -> String {
    format!("{}_cal_env.txt", dataset.lower())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_qualified_by_group_and_lowercase_dataset() {
        let paths = JobPaths::new(PathBuf::from("/work"));
        let dataset = DatasetId::parse("J8CB010B0").expect("dataset");
        assert_eq!(paths.input_dir(&dataset), PathBuf::from("/work/inputs/j8cb010b0"));
        assert_eq!(
            paths.output_dir(&dataset),
            PathBuf::from("/work/outputs/acs/j8cb010b0")
        );
        assert_eq!(
            paths.env_dir(&dataset),
            PathBuf::from("/work/outputs/acs/j8cb010b0/env")
        );
        assert_eq!(
            paths.marker_path("error-J8CB010B0"),
            PathBuf::from("/work/messages/error-J8CB010B0")
        );
        assert_eq!(env_snapshot_name(&dataset), "j8cb010b0_cal_env.txt");
    }

    #[test]
    fn rel_path_strips_root() {
        let paths = JobPaths::new(PathBuf::from("/work"));
        assert_eq!(
            paths.rel_path(Path::new("/work/outputs/svm/acs_8ph_01/a.fits")),
            Some("outputs/svm/acs_8ph_01/a.fits".to_string())
        );
        assert_eq!(paths.rel_path(Path::new("/elsewhere/a.fits")), None);
    }
}
