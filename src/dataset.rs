//! Dataset identifiers and the kinds they classify into.
//!
//! The lexical form of an id decides everything downstream: which pipeline
//! descriptor runs, where outputs land, and how inputs are retrieved.
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

static SINGLE_EXPOSURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9]{8}$").expect("regex for exposure ids"));
static SINGLE_VISIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(acs|wfc3)_([a-z0-9]{3})_([a-z0-9]{2})$").expect("regex for visit mosaic ids")
});
static MULTI_VISIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^skycell-p\d{4}x\d{2}y\d{2}$").expect("regex for skycell ids")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Instrument {
    Acs,
    Wfpc2,
    Hsp,
    Wfpc,
    Foc,
    Fos,
    Hrs,
    Eng,
    Fgs,
    Wfc3,
    Nicmos,
    Stis,
    Cos,
}

const INSTRUMENT_LETTERS: &[(char, Instrument)] = &[
    ('J', Instrument::Acs),
    ('U', Instrument::Wfpc2),
    ('V', Instrument::Hsp),
    ('W', Instrument::Wfpc),
    ('X', Instrument::Foc),
    ('Y', Instrument::Fos),
    ('Z', Instrument::Hrs),
    ('E', Instrument::Eng),
    ('F', Instrument::Fgs),
    ('I', Instrument::Wfc3),
    ('N', Instrument::Nicmos),
    ('O', Instrument::Stis),
    ('L', Instrument::Cos),
];

impl Instrument {
    pub fn from_letter(letter: char) -> Option<Instrument> {
        let letter = letter.to_ascii_uppercase();
        INSTRUMENT_LETTERS
            .iter()
            .find(|(candidate, _)| *candidate == letter)
            .map(|(_, instrument)| *instrument)
    }

    pub fn letter(self) -> char {
        INSTRUMENT_LETTERS
            .iter()
            .find(|(_, instrument)| *instrument == self)
            .map(|(letter, _)| *letter)
            .unwrap_or('?')
    }

    pub fn name(self) -> &'static str {
        match self {
            Instrument::Acs => "acs",
            Instrument::Wfpc2 => "wfpc2",
            Instrument::Hsp => "hsp",
            Instrument::Wfpc => "wfpc",
            Instrument::Foc => "foc",
            Instrument::Fos => "fos",
            Instrument::Hrs => "hrs",
            Instrument::Eng => "eng",
            Instrument::Fgs => "fgs",
            Instrument::Wfc3 => "wfc3",
            Instrument::Nicmos => "nicmos",
            Instrument::Stis => "stis",
            Instrument::Cos => "cos",
        }
    }

    fn from_name(name: &str) -> Option<Instrument> {
        INSTRUMENT_LETTERS
            .iter()
            .map(|(_, instrument)| *instrument)
            .find(|instrument| instrument.name() == name)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetKind {
    SingleExposure { instrument: Instrument },
    SingleVisitMosaic { instrument: Instrument },
    MultiVisitMosaic,
}

impl DatasetKind {
    /// Directory level that groups outputs of this kind: the instrument for
    /// single exposures, `svm` or `mvm` for mosaics.
    pub fn output_group(&self) -> &'static str {
        match self {
            DatasetKind::SingleExposure { instrument } => instrument.name(),
            DatasetKind::SingleVisitMosaic { .. } => "svm",
            DatasetKind::MultiVisitMosaic => "mvm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassificationError {
    #[error("invalid dataset name {0:?}: not an exposure, visit mosaic, or skycell id")]
    Malformed(String),
    #[error("dataset {dataset} belongs to {instrument}, which has no calibration pipeline")]
    Unsupported {
        dataset: String,
        instrument: Instrument,
    },
}

/// Classify `id` by its lexical form.
pub fn classify(id: &str) -> Result<DatasetKind, ClassificationError> {
    let upper = id.to_ascii_uppercase();
    if SINGLE_EXPOSURE_RE.is_match(&upper) {
        let instrument = upper
            .chars()
            .next()
            .and_then(Instrument::from_letter)
            .ok_or_else(|| ClassificationError::Malformed(id.to_string()))?;
        return Ok(DatasetKind::SingleExposure { instrument });
    }
    let lower = id.to_ascii_lowercase();
    if let Some(caps) = SINGLE_VISIT_RE.captures(&lower) {
        let instrument = caps
            .get(1)
            .and_then(|name| Instrument::from_name(name.as_str()))
            .ok_or_else(|| ClassificationError::Malformed(id.to_string()))?;
        return Ok(DatasetKind::SingleVisitMosaic { instrument });
    }
    if MULTI_VISIT_RE.is_match(&lower) {
        return Ok(DatasetKind::MultiVisitMosaic);
    }
    Err(ClassificationError::Malformed(id.to_string()))
}

/// A dataset id together with its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetId {
    id: String,
    kind: DatasetKind,
}

impl DatasetId {
    pub fn parse(id: &str) -> Result<Self, ClassificationError> {
        let id = id.trim();
        let kind = classify(id)?;
        Ok(Self {
            id: id.to_string(),
            kind,
        })
    }

    /// The id exactly as given; used in marker names.
    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Lowercase form used for directory and file names.
    pub fn lower(&self) -> String {
        self.id.to_ascii_lowercase()
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    /// Observation set a visit mosaic covers, e.g. `acs_8ph_01` => `j8ph01`.
    pub fn observation_set(&self) -> Option<String> {
        let DatasetKind::SingleVisitMosaic { instrument } = self.kind else {
            return None;
        };
        let lower = self.lower();
        let caps = SINGLE_VISIT_RE.captures(&lower)?;
        let program = caps.get(2)?.as_str();
        let visit = caps.get(3)?.as_str();
        Some(format!(
            "{}{program}{visit}",
            instrument.letter().to_ascii_lowercase()
        ))
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
