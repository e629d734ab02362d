//! Static per-kind pipeline configuration.
//!
//! Each variant is plain data plus four hook functions; the manager never
//! branches on the variant itself.
use crate::dataset::{ClassificationError, DatasetId, DatasetKind, Instrument};
use crate::exit_codes::ExitCode;
use crate::fits::{self, CardValue};
use crate::retrieve;
use anyhow::Result;
use std::path::{Path, PathBuf};

pub const ENV_SNAPSHOT_SUFFIX: &str = "_cal_env.txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Acs,
    Wfc3,
    Cos,
    Stis,
    Svm,
    Mvm,
}

/// Per-variant customization points.
#[derive(Clone, Copy)]
pub struct Hooks {
    /// Files that get reference assignment and version stamps.
    pub raw_files: fn(&[PathBuf]) -> Vec<PathBuf>,
    /// Association tables; non-empty selects the associated branch.
    pub assoc_files: fn(&[PathBuf]) -> Vec<PathBuf>,
    /// Stage inputs when there is no association.
    pub unassoc_files: fn(&[PathBuf]) -> Vec<PathBuf>,
    /// Runs on all inputs right before the first stage.
    pub pre_stage: fn(&[PathBuf]) -> Result<()>,
}

pub struct Descriptor {
    pub variant: Variant,
    pub name: &'static str,
    /// Product suffixes requested by remote query; empty for mosaics, which
    /// are driven by a poller file instead.
    pub retrieval_suffixes: &'static [&'static str],
    pub stage1: &'static str,
    pub stage2: Option<&'static str>,
    pub stage1_code: ExitCode,
    pub stage2_code: ExitCode,
    /// Non-zero stage statuses that are not failures.
    pub tolerated: &'static [i32],
    /// Outputs with these endings are deleted before egress.
    pub delete_suffixes: &'static [&'static str],
    /// Whether unassociated inputs also go through stage2.
    pub stage2_unassociated: bool,
    pub hooks: Hooks,
}

fn file_name(path: &Path) -> &str {
    path.file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
}

fn select(files: &[PathBuf], keep: impl Fn(&str) -> bool) -> Vec<PathBuf> {
    files
        .iter()
        .filter(|path| keep(file_name(path)))
        .cloned()
        .collect()
}

fn default_raw_files(files: &[PathBuf]) -> Vec<PathBuf> {
    select(files, |name| name.contains("_raw"))
}

fn default_assoc_files(files: &[PathBuf]) -> Vec<PathBuf> {
    select(files, |name| name.ends_with("_asn.fits"))
}

fn default_unassoc_files(files: &[PathBuf]) -> Vec<PathBuf> {
    default_raw_files(files)
}

fn no_pre_stage(_files: &[PathBuf]) -> Result<()> {
    Ok(())
}

fn no_files(_files: &[PathBuf]) -> Vec<PathBuf> {
    Vec::new()
}

fn cos_unassoc_files(files: &[PathBuf]) -> Vec<PathBuf> {
    default_raw_files(files).into_iter().take(1).collect()
}

fn cos_pre_stage(files: &[PathBuf]) -> Result<()> {
    for path in default_raw_files(files) {
        fits::set_keywords(&path, &[("RANDSEED", CardValue::Int(1))])?;
    }
    Ok(())
}

fn stis_raw_files(files: &[PathBuf]) -> Vec<PathBuf> {
    select(files, |name| {
        name.ends_with("_raw.fits") || name.ends_with("_wav.fits") || name.ends_with("_tag.fits")
    })
}

fn stis_unassoc_files(files: &[PathBuf]) -> Vec<PathBuf> {
    let raw = select(files, |name| name.ends_with("_raw.fits"));
    if raw.is_empty() {
        select(files, |name| name.ends_with("_wav.fits"))
    } else {
        raw
    }
}

fn poller_files(files: &[PathBuf]) -> Vec<PathBuf> {
    select(files, |name| name.ends_with("_input.out"))
}

const DEFAULT_HOOKS: Hooks = Hooks {
    raw_files: default_raw_files,
    assoc_files: default_assoc_files,
    unassoc_files: default_unassoc_files,
    pre_stage: no_pre_stage,
};

const MOSAIC_HOOKS: Hooks = Hooks {
    raw_files: no_files,
    assoc_files: no_files,
    unassoc_files: poller_files,
    pre_stage: no_pre_stage,
};

pub static ACS: Descriptor = Descriptor {
    variant: Variant::Acs,
    name: "acs",
    retrieval_suffixes: &["ASN", "RAW"],
    stage1: "calacs.e",
    stage2: Some("runastrodriz"),
    stage1_code: ExitCode::Stage1Error,
    stage2_code: ExitCode::Stage2Error,
    tolerated: &[],
    delete_suffixes: &[],
    stage2_unassociated: true,
    hooks: DEFAULT_HOOKS,
};

pub static WFC3: Descriptor = Descriptor {
    variant: Variant::Wfc3,
    name: "wfc3",
    retrieval_suffixes: &["ASN", "RAW"],
    stage1: "calwf3.e",
    stage2: Some("runastrodriz"),
    stage1_code: ExitCode::Stage1Error,
    stage2_code: ExitCode::Stage2Error,
    tolerated: &[],
    delete_suffixes: &[],
    stage2_unassociated: true,
    hooks: DEFAULT_HOOKS,
};

pub static COS: Descriptor = Descriptor {
    variant: Variant::Cos,
    name: "cos",
    retrieval_suffixes: &[
        "ASN",
        "RAW",
        "EPC",
        "SPT",
        "RAWACCUM",
        "RAWACCUM_A",
        "RAWACCUM_B",
        "RAWACQ",
        "RAWTAG",
        "RAWTAG_A",
        "RAWTAG_B",
        "PHA_A",
        "PHA_B",
    ],
    stage1: "calcos",
    stage2: None,
    stage1_code: ExitCode::Stage1Error,
    stage2_code: ExitCode::Stage2Error,
    // calcos exits 5 on RAWACQ exposures it has nothing to do for.
    tolerated: &[5],
    delete_suffixes: &[],
    stage2_unassociated: false,
    hooks: Hooks {
        unassoc_files: cos_unassoc_files,
        pre_stage: cos_pre_stage,
        ..DEFAULT_HOOKS
    },
};

pub static STIS: Descriptor = Descriptor {
    variant: Variant::Stis,
    name: "stis",
    retrieval_suffixes: &["ASN", "RAW", "EPC", "TAG", "WAV"],
    stage1: "cs0.e -tv",
    stage2: None,
    stage1_code: ExitCode::Stage1Error,
    stage2_code: ExitCode::Stage2Error,
    tolerated: &[],
    delete_suffixes: &["_epc.fits"],
    stage2_unassociated: false,
    hooks: Hooks {
        raw_files: stis_raw_files,
        assoc_files: no_files,
        unassoc_files: stis_unassoc_files,
        pre_stage: no_pre_stage,
    },
};

pub static SVM: Descriptor = Descriptor {
    variant: Variant::Svm,
    name: "svm",
    retrieval_suffixes: &[],
    stage1: "runsinglehap",
    stage2: None,
    stage1_code: ExitCode::SvmWorkflowError,
    stage2_code: ExitCode::SvmWorkflowError,
    tolerated: &[],
    delete_suffixes: &[],
    stage2_unassociated: false,
    hooks: MOSAIC_HOOKS,
};

pub static MVM: Descriptor = Descriptor {
    variant: Variant::Mvm,
    name: "mvm",
    retrieval_suffixes: &[],
    stage1: "runmultihap",
    stage2: None,
    stage1_code: ExitCode::MvmWorkflowError,
    stage2_code: ExitCode::MvmWorkflowError,
    tolerated: &[],
    delete_suffixes: &[],
    stage2_unassociated: false,
    hooks: MOSAIC_HOOKS,
};

/// The one descriptor that handles `dataset`.
pub fn select_descriptor(
    dataset: &DatasetId,
) -> Result<&'static Descriptor, ClassificationError> {
    match dataset.kind() {
        DatasetKind::SingleExposure { instrument } => match instrument {
            Instrument::Acs => Ok(&ACS),
            Instrument::Wfc3 => Ok(&WFC3),
            Instrument::Cos => Ok(&COS),
            Instrument::Stis => Ok(&STIS),
            other => Err(ClassificationError::Unsupported {
                dataset: dataset.as_str().to_string(),
                instrument: other,
            }),
        },
        DatasetKind::SingleVisitMosaic { .. } => Ok(&SVM),
        DatasetKind::MultiVisitMosaic => Ok(&MVM),
    }
}

impl Descriptor {
    pub fn is_mosaic(&self) -> bool {
        matches!(self.variant, Variant::Svm | Variant::Mvm)
    }

    /// File name patterns that make up the inputs in a work directory.
    pub fn input_patterns(&self, dataset: &DatasetId) -> Vec<String> {
        let mut patterns = vec!["*.fits".to_string()];
        if self.is_mosaic() {
            patterns.push(retrieve::poller_file_name(&dataset.lower()));
        }
        patterns
    }

    /// File name patterns collected as products from a work directory.
    pub fn output_patterns(&self, dataset: &DatasetId) -> Vec<String> {
        let lower = dataset.lower();
        match self.variant {
            Variant::Acs | Variant::Wfc3 | Variant::Cos | Variant::Stis => vec![
                "*.fits".to_string(),
                "*.tra".to_string(),
                format!("*{ENV_SNAPSHOT_SUFFIX}"),
            ],
            Variant::Svm => {
                let obs_set = dataset.observation_set().unwrap_or_else(|| lower.clone());
                vec![
                    format!("hst_*{obs_set}*.fits"),
                    format!("hst_*{obs_set}*.txt"),
                    format!("hst_*{obs_set}*.ecsv"),
                    format!("{lower}_manifest.txt"),
                    "astrodrizzle.log".to_string(),
                    format!("*{ENV_SNAPSHOT_SUFFIX}"),
                ]
            }
            Variant::Mvm => vec![
                format!("hst_{lower}*.fits"),
                format!("hst_{lower}*.txt"),
                format!("{lower}_manifest.txt"),
                format!("*{ENV_SNAPSHOT_SUFFIX}"),
            ],
        }
    }

    pub fn should_delete(&self, name: &str) -> bool {
        self.delete_suffixes
            .iter()
            .any(|suffix| name.ends_with(suffix))
    }
}
