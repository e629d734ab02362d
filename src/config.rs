//! Job settings resolved from the environment.
//!
//! Settings are read once at startup and passed down explicitly, so fault
//! simulation and collaborator endpoints never depend on ambient lookups deep
//! inside a phase.
use crate::retry::RetryPolicy;
use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::time::Duration;

pub const SIMULATE_ERROR_VAR: &str = "SIMULATE_ERROR";
pub const CRDS_CONTEXT_VAR: &str = "CRDS_CONTEXT";
pub const READONLY_CACHE_VAR: &str = "CRDS_READONLY_CACHE";
pub const CSYS_VER_VAR: &str = "CSYS_VER";
pub const RETRIEVE_URL_VAR: &str = "CALDP_RETRIEVE_URL";
pub const PRODUCT_LIST_URL_VAR: &str = "CALDP_PRODUCT_LIST_URL";
pub const BESTREFS_COMMAND_VAR: &str = "CALDP_BESTREFS_COMMAND";
pub const OBJECT_STORE_ROOT_VAR: &str = "CALDP_OBJECT_STORE_ROOT";
pub const RETRY_ATTEMPTS_VAR: &str = "CALDP_RETRY_ATTEMPTS";
pub const RETRY_MIN_SECONDS_VAR: &str = "CALDP_RETRY_MIN_SECONDS";
pub const RETRY_MAX_SECONDS_VAR: &str = "CALDP_RETRY_MAX_SECONDS";
pub const RETRY_BACKOFF_VAR: &str = "CALDP_RETRY_BACKOFF";

/// Default remote-query download endpoint; the product file name is appended.
pub const DEFAULT_RETRIEVE_URL: &str =
    "https://mast.stsci.edu/api/v0.1/Download/file?uri=mast:HST/product";
/// Default product listing endpoint; the upper-case dataset id is appended
/// and the response is a JSON array of products.
pub const DEFAULT_PRODUCT_LIST_URL: &str =
    "https://mast.stsci.edu/search/hst/api/v0.1/products?dataset=";
pub const DEFAULT_BESTREFS_COMMAND: &str = "crds bestrefs";
pub const UNDEFINED_VERSION: &str = "UNDEFINED";

/// Environment prefixes captured in the per-dataset environment snapshot.
pub const SNAPSHOT_PREFIXES: &[&str] = &["CALDP_", "CRDS_", "CSYS_VER"];

#[derive(Debug, Clone)]
pub struct Settings {
    /// Exit code to simulate at the top of every guarded block.
    pub simulate_error: Option<i32>,
    /// Reference context override passed to reference assignment.
    pub crds_context: Option<String>,
    /// When set, reference assignment only annotates files and never syncs.
    pub readonly_cache: bool,
    pub csys_ver: String,
    pub retrieve_url: String,
    pub product_list_url: String,
    pub bestrefs_command: String,
    pub object_store_root: Option<PathBuf>,
    pub retry: RetryPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            simulate_error: None,
            crds_context: None,
            readonly_cache: false,
            csys_ver: UNDEFINED_VERSION.to_string(),
            retrieve_url: DEFAULT_RETRIEVE_URL.to_string(),
            product_list_url: DEFAULT_PRODUCT_LIST_URL.to_string(),
            bestrefs_command: DEFAULT_BESTREFS_COMMAND.to_string(),
            object_store_root: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve settings through `lookup`, treating empty values as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let simulate_error = get(SIMULATE_ERROR_VAR)
            .map(|value| {
                value
                    .parse::<i32>()
                    .with_context(|| format!("{SIMULATE_ERROR_VAR} must be an integer exit code"))
            })
            .transpose()?
            .filter(|code| *code != 0);

        let readonly_cache = match get(READONLY_CACHE_VAR) {
            Some(value) => parse_flag(READONLY_CACHE_VAR, &value)?,
            None => false,
        };

        let mut retry = defaults.retry.clone();
        if let Some(value) = get(RETRY_ATTEMPTS_VAR) {
            retry.max_attempts = value
                .parse::<u32>()
                .with_context(|| format!("parse {RETRY_ATTEMPTS_VAR}"))?;
            if retry.max_attempts == 0 {
                return Err(anyhow!("{RETRY_ATTEMPTS_VAR} must be at least 1"));
            }
        }
        if let Some(value) = get(RETRY_MIN_SECONDS_VAR) {
            retry.min_delay = parse_seconds(RETRY_MIN_SECONDS_VAR, &value)?;
        }
        if let Some(value) = get(RETRY_MAX_SECONDS_VAR) {
            retry.max_delay = parse_seconds(RETRY_MAX_SECONDS_VAR, &value)?;
        }
        if let Some(value) = get(RETRY_BACKOFF_VAR) {
            retry.backoff = value
                .parse::<f64>()
                .with_context(|| format!("parse {RETRY_BACKOFF_VAR}"))?;
        }
        if retry.min_delay > retry.max_delay {
            return Err(anyhow!(
                "retry min delay {:?} exceeds max delay {:?}",
                retry.min_delay,
                retry.max_delay
            ));
        }

        Ok(Self {
            simulate_error,
            crds_context: get(CRDS_CONTEXT_VAR),
            readonly_cache,
            csys_ver: get(CSYS_VER_VAR).unwrap_or(defaults.csys_ver),
            retrieve_url: get(RETRIEVE_URL_VAR).unwrap_or(defaults.retrieve_url),
            product_list_url: get(PRODUCT_LIST_URL_VAR).unwrap_or(defaults.product_list_url),
            bestrefs_command: get(BESTREFS_COMMAND_VAR).unwrap_or(defaults.bestrefs_command),
            object_store_root: get(OBJECT_STORE_ROOT_VAR).map(PathBuf::from),
            retry,
        })
    }

    /// Root directory that backs `s3://` locations.
    pub fn resolve_object_store_root(&self) -> Result<PathBuf> {
        if let Some(root) = &self.object_store_root {
            return Ok(root.clone());
        }
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| anyhow!("cannot determine home directory"))?;
        Ok(data_dir.join("caldp").join("buckets"))
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("{key} must be a boolean flag (got {value:?})")),
    }
}

fn parse_seconds(key: &str, value: &str) -> Result<Duration> {
    let seconds = value
        .parse::<f64>()
        .with_context(|| format!("parse {key}"))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(anyhow!("{key} must be a non-negative number of seconds"));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Sorted `KEY=VALUE` lines for the environment snapshot of a job.
pub fn environment_snapshot(vars: impl IntoIterator<Item = (String, String)>) -> Vec<String> {
    let mut lines: Vec<String> = vars
        .into_iter()
        .filter(|(key, _)| SNAPSHOT_PREFIXES.iter().any(|prefix| key.starts_with(prefix)))
        .map(|(key, value)| format!("{key}={value}"))
        .collect();
    lines.sort();
    lines
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
