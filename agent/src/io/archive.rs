//! Extraction of gzip-compressed configuration archives.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result, bail};
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, instrument};

/// Unpack a `.tar.gz` archive into `dest` and return the configuration root.
///
/// When every entry lives under one top-level directory (as source-host
/// tarballs do) that directory is the root; otherwise `dest` itself is.
/// Pax headers are skipped. Links, devices and any path escaping `dest` are
/// rejected.
#[instrument(skip_all, fields(dest = %dest.display(), bytes = bytes.len()))]
pub fn extract_tar_gz(bytes: &[u8], dest: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dest).with_context(|| format!("create directory {}", dest.display()))?;

    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut roots = BTreeSet::new();
    let mut files_at_root = false;
    let mut entries = 0usize;

    for entry in archive.entries().context("read archive entries")? {
        let mut entry = entry.context("read archive entry")?;
        let entry_type = entry.header().entry_type();
        if matches!(entry_type, EntryType::XGlobalHeader | EntryType::XHeader) {
            continue;
        }

        let raw = entry.path().context("read entry path")?.into_owned();
        let relative = sanitize_entry_path(&raw)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&relative);

        match entry_type {
            EntryType::Directory => {
                fs::create_dir_all(&target)
                    .with_context(|| format!("create directory {}", target.display()))?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create directory {}", parent.display()))?;
                }
                entry
                    .unpack(&target)
                    .with_context(|| format!("write {}", target.display()))?;
                if relative.components().count() == 1 {
                    files_at_root = true;
                }
            }
            other => bail!(
                "unsupported archive entry type {other:?} for {}",
                raw.display()
            ),
        }

        if let Some(Component::Normal(first)) = relative.components().next() {
            roots.insert(first.to_os_string());
        }
        entries += 1;
    }

    debug!(entries, "archive extracted");
    if roots.len() == 1
        && !files_at_root
        && let Some(root) = roots.into_iter().next()
    {
        return Ok(dest.join(root));
    }
    Ok(dest.to_path_buf())
}

/// Strip `.` components and reject absolute or parent-relative paths.
fn sanitize_entry_path(path: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!("archive entry escapes destination: {}", path.display())
            }
        }
    }
    Ok(clean)
}
