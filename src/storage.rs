//! Object storage addresses and the store interface.
//!
//! Jobs only ever need whole-object get/put/delete/list, so the store is a
//! narrow trait. `FsObjectStore` backs `s3://bucket/key` with a directory
//! tree, which is what local batch runs and the tests use.
use anyhow::{anyhow, Context, Result};
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

const COPY_CHUNK_BYTES: usize = 64 * 1024;

/// An `s3://bucket/key` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    bucket: String,
    key: String,
}

impl S3Location {
    /// Parse `s3://bucket[/key]`; the key may be empty.
    pub fn parse(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("s3://")
            .ok_or_else(|| anyhow!("object storage uri must start with s3:// (got {uri:?})"))?;
        let (bucket, key) = match rest.split_once('/') {
            Some((bucket, key)) => (bucket, key),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(anyhow!("object storage uri {uri:?} names no bucket"));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.trim_matches('/').to_string(),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Append `name` as a further key component.
    pub fn join(&self, name: &str) -> S3Location {
        let name = name.trim_matches('/');
        let key = if self.key.is_empty() {
            name.to_string()
        } else {
            format!("{}/{name}", self.key)
        };
        S3Location {
            bucket: self.bucket.clone(),
            key,
        }
    }

    /// Last key component.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or_default()
    }
}

impl fmt::Display for S3Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            write!(f, "s3://{}", self.bucket)
        } else {
            write!(f, "s3://{}/{}", self.bucket, self.key)
        }
    }
}

pub trait ObjectStore {
    /// Download one object to `dest`.
    fn get(&self, source: &S3Location, dest: &Path) -> Result<()>;
    /// Upload `source`, reporting transferred byte counts to `progress`.
    fn put(&self, source: &Path, dest: &S3Location, progress: &dyn Fn(u64)) -> Result<()>;
    /// Delete one object. Returns false when it did not exist.
    fn delete(&self, target: &S3Location) -> Result<bool>;
    /// Objects under `prefix`, sorted.
    fn list(&self, prefix: &S3Location) -> Result<Vec<S3Location>>;
}

/// Filesystem-backed store: `s3://bucket/key` lives at `<root>/bucket/key`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn object_path(&self, location: &S3Location) -> PathBuf {
        let mut path = self.root.join(location.bucket());
        for part in location.key().split('/').filter(|part| !part.is_empty()) {
            path.push(part);
        }
        path
    }
}

impl ObjectStore for FsObjectStore {
    fn get(&self, source: &S3Location, dest: &Path) -> Result<()> {
        let path = self.object_path(source);
        if !path.is_file() {
            return Err(anyhow!("object {source} does not exist"));
        }
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::copy(&path, dest)
            .with_context(|| format!("download {source} to {}", dest.display()))?;
        Ok(())
    }

    fn put(&self, source: &Path, dest: &S3Location, progress: &dyn Fn(u64)) -> Result<()> {
        let target = self.object_path(dest);
        let parent = target
            .parent()
            .ok_or_else(|| anyhow!("object {dest} has no parent"))?;
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        let tmp_path = parent.join(format!(".{}.tmp", dest.file_name()));

        let mut reader =
            File::open(source).with_context(|| format!("open {}", source.display()))?;
        let mut writer =
            File::create(&tmp_path).with_context(|| format!("create {}", tmp_path.display()))?;
        let mut buffer = vec![0u8; COPY_CHUNK_BYTES];
        loop {
            let read = reader
                .read(&mut buffer)
                .with_context(|| format!("read {}", source.display()))?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buffer[..read])
                .with_context(|| format!("upload {dest}"))?;
            progress(read as u64);
        }
        writer.flush().with_context(|| format!("upload {dest}"))?;
        drop(writer);
        fs::rename(&tmp_path, &target).with_context(|| format!("publish {dest}"))?;
        Ok(())
    }

    fn delete(&self, target: &S3Location) -> Result<bool> {
        let path = self.object_path(target);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("delete {target}")),
        }
    }

    fn list(&self, prefix: &S3Location) -> Result<Vec<S3Location>> {
        let base = self.object_path(prefix);
        if !base.exists() {
            return Ok(Vec::new());
        }
        let bucket_root = self.root.join(prefix.bucket());
        let mut found = Vec::new();
        for entry in WalkDir::new(&base).sort_by_file_name() {
            let entry = entry.with_context(|| format!("list {prefix}"))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&bucket_root)
                .context("strip bucket prefix")?;
            let key = rel.to_string_lossy().replace('\\', "/");
            found.push(S3Location {
                bucket: prefix.bucket().to_string(),
                key,
            });
        }
        found.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(found)
    }
}

/// Running byte counter for one upload.
///
/// The store may call back from several part uploads at once, so the count
/// sits behind a mutex.
pub struct UploadProgress {
    label: String,
    total: u64,
    seen: Mutex<u64>,
}

impl UploadProgress {
    pub fn new(label: impl Into<String>, total: u64) -> Self {
        Self {
            label: label.into(),
            total,
            seen: Mutex::new(0),
        }
    }

    pub fn for_file(path: &Path) -> Result<Self> {
        let total = fs::metadata(path)
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        Ok(Self::new(path.display().to_string(), total))
    }

    /// Add `bytes` and return the completed percentage.
    pub fn record(&self, bytes: u64) -> f64 {
        let seen = match self.seen.lock() {
            Ok(mut seen) => {
                *seen += bytes;
                *seen
            }
            Err(poisoned) => {
                let mut seen = poisoned.into_inner();
                *seen += bytes;
                *seen
            }
        };
        let percent = if self.total == 0 {
            100.0
        } else {
            seen as f64 / self.total as f64 * 100.0
        };
        tracing::debug!(
            file = %self.label,
            seen,
            total = self.total,
            "upload progress {percent:.2}%"
        );
        percent
    }

    pub fn seen(&self) -> u64 {
        self.seen.lock().map(|seen| *seen).unwrap_or_default()
    }
}
