//! Gzipped tar bundles for object-storage transfer.
use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tar::{Archive, Builder};

/// One file to bundle and the name it gets inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub source: PathBuf,
    pub name: String,
}

/// Unpack `archive` into `dest`.
///
/// Entries that would land outside `dest` are refused by `tar`.
pub fn extract(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut tarball = Archive::new(GzDecoder::new(file));
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;
    tarball
        .unpack(dest)
        .with_context(|| format!("extract {} into {}", archive.display(), dest.display()))?;
    Ok(())
}

/// Write `entries` into a new gzipped tarball at `archive`.
///
/// An existing archive from an earlier attempt is replaced; the new one is
/// only moved into place once complete.
pub fn create(archive: &Path, entries: &[ArchiveEntry]) -> Result<()> {
    if entries.is_empty() {
        return Err(anyhow!("no files to bundle into {}", archive.display()));
    }
    let parent = archive
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    let file_name = archive
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("bundle.tar.gz");
    let tmp_path = parent.join(format!(".{file_name}.tmp"));

    let file = File::create(&tmp_path).with_context(|| format!("create {}", tmp_path.display()))?;
    let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
    for entry in entries {
        builder
            .append_path_with_name(&entry.source, &entry.name)
            .with_context(|| format!("add {} to {}", entry.source.display(), archive.display()))?;
    }
    let encoder = builder
        .into_inner()
        .with_context(|| format!("finish {}", archive.display()))?;
    encoder
        .finish()
        .with_context(|| format!("compress {}", archive.display()))?;
    fs::rename(&tmp_path, archive).with_context(|| format!("publish {}", archive.display()))?;
    Ok(())
}

/// Member names in `archive`, sorted.
#[cfg(test)]
pub fn list(archive: &Path) -> Result<Vec<String>> {
    let file = File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    let mut tarball = Archive::new(GzDecoder::new(file));
    let mut names = Vec::new();
    for entry in tarball
        .entries()
        .with_context(|| format!("read {}", archive.display()))?
    {
        let entry = entry.with_context(|| format!("read {}", archive.display()))?;
        let path = entry.path().context("decode archive member name")?;
        names.push(path.to_string_lossy().replace('\\', "/"));
    }
    names.sort();
    Ok(names)
}
