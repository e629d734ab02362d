//! Remote-query retrieval of input products.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(300);

pub trait Retriever {
    /// Download every product of `dataset` carrying one of `suffixes` into
    /// `dest`, association members included.
    fn retrieve(&self, dataset: &str, suffixes: &[&str], dest: &Path) -> Result<Vec<PathBuf>>;

    /// Download product `name` into `dest`. `Ok(None)` means the archive
    /// has no such product.
    fn fetch(&self, name: &str, dest: &Path) -> Result<Option<PathBuf>>;
}

/// Whether product file `name` carries one of `suffixes`:
/// `j8cb01u3q_raw.fits` has `RAW`, `la8q99jcq_rawtag_a.fits` has `RAWTAG_A`.
pub fn has_suffix(name: &str, suffixes: &[&str]) -> bool {
    let lower = name.to_ascii_lowercase();
    let Some((_, suffix)) = lower
        .strip_suffix(".fits")
        .and_then(|stem| stem.split_once('_'))
    else {
        return false;
    };
    suffixes
        .iter()
        .any(|wanted| wanted.eq_ignore_ascii_case(suffix))
}

/// One entry of a product listing: a bare file name or an archive record.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListedProduct {
    Name(String),
    Record {
        #[serde(rename = "productFilename")]
        product_filename: String,
    },
}

/// Product file names in a JSON listing, keeping those with `suffixes`.
pub fn select_products(listing: &str, suffixes: &[&str]) -> Result<Vec<String>> {
    let products: Vec<ListedProduct> =
        serde_json::from_str(listing).context("parse product listing")?;
    let mut names: Vec<String> = products
        .into_iter()
        .map(|product| match product {
            ListedProduct::Name(name) => name,
            ListedProduct::Record { product_filename } => product_filename,
        })
        .filter(|name| has_suffix(name, suffixes))
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}

/// Name of the mosaic poller file for `dataset`.
pub fn poller_file_name(dataset: &str) -> String {
    format!("{dataset}_input.out")
}

/// Exposure file names listed in a mosaic poller file.
///
/// Each non-blank line is comma separated with the file name first.
pub fn parse_poller(text: &str) -> Vec<String> {
    let mut names: Vec<String> = text
        .lines()
        .filter_map(|line| line.split(',').next())
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.starts_with('#'))
        .map(str::to_string)
        .collect();
    names.dedup();
    names
}

/// Lists products at `<list_url><DATASET>` and downloads each from
/// `<base_url>/<name>` over HTTP(S).
pub struct HttpRetriever {
    base_url: String,
    list_url: String,
    agent: ureq::Agent,
}

impl HttpRetriever {
    pub fn new(base_url: impl Into<String>, list_url: impl Into<String>) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(HTTP_TIMEOUT))
            .build();
        Self {
            base_url: base_url.into(),
            list_url: list_url.into(),
            agent: ureq::Agent::new_with_config(config),
        }
    }

    pub fn url_for(&self, name: &str) -> String {
        format!("{}/{name}", self.base_url.trim_end_matches('/'))
    }

    pub fn listing_url(&self, dataset: &str) -> String {
        format!("{}{}", self.list_url, dataset.to_ascii_uppercase())
    }
}

impl Retriever for HttpRetriever {
    fn retrieve(&self, dataset: &str, suffixes: &[&str], dest: &Path) -> Result<Vec<PathBuf>> {
        let url = self.listing_url(dataset);
        tracing::debug!(%url, "listing products");
        let response = match self.agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::StatusCode(404)) => return Ok(Vec::new()),
            Err(err) => return Err(anyhow::Error::new(err).context(format!("GET {url}"))),
        };
        let listing = response
            .into_body()
            .read_to_string()
            .with_context(|| format!("read {url}"))?;
        let mut fetched = Vec::new();
        for name in select_products(&listing, suffixes)? {
            if let Some(path) = self.fetch(&name, dest)? {
                fetched.push(path);
            }
        }
        Ok(fetched)
    }

    fn fetch(&self, name: &str, dest: &Path) -> Result<Option<PathBuf>> {
        let url = self.url_for(name);
        tracing::debug!(%url, "requesting product");
        let response = match self.agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::StatusCode(404)) => return Ok(None),
            Err(err) => return Err(anyhow::Error::new(err).context(format!("GET {url}"))),
        };
        fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
        let path = dest.join(name);
        let tmp_path = dest.join(format!(".{name}.part"));
        let mut file =
            File::create(&tmp_path).with_context(|| format!("create {}", tmp_path.display()))?;
        let mut reader = response.into_body().into_reader();
        io::copy(&mut reader, &mut file).with_context(|| format!("download {url}"))?;
        drop(file);
        fs::rename(&tmp_path, &path).with_context(|| format!("publish {}", path.display()))?;
        Ok(Some(path))
    }
}
