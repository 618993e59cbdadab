//! Read-only inspection views over an archive's produced metadata.
//!
//! Everything here queries the sidecar manifest and the embedded file
//! listing; nothing re-hashes content (that is the verifier's job). Absent
//! metadata degrades to empty views, never panics.

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::archiver::{MANIFEST_NAME, METADATA_DIR};
use crate::error::{ArchiveError, Result};
use crate::filelist::{decode_filelist, FILELIST_NAME};
use crate::manifest::{sidecar_manifest_path, ArchiveManifest, EntryKind, FileRecord, MemberCount};
use crate::verifier::read_archive_member;

/// High-level archive summary for display.
#[derive(Serialize, Debug, Clone)]
pub struct InspectSummary {
    pub filename: String,
    pub size_bytes: u64,
    pub manifest_present: bool,
    pub filelist_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_utc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member_count: Option<MemberCount>,
}

/// Aggregate statistics for one file extension.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtensionStat {
    pub count: u64,
    pub total_bytes: u64,
}

/// Lazily-loading, read-only archive inspector.
pub struct ArchiveInspector {
    archive_path: PathBuf,
    manifest_path: PathBuf,
    manifest: OnceCell<Option<ArchiveManifest>>,
    filelist: OnceCell<Vec<FileRecord>>,
}

impl ArchiveInspector {
    pub fn new(archive_path: &Path, manifest_path: Option<PathBuf>) -> Result<Self> {
        if !archive_path.exists() {
            return Err(ArchiveError::ArchiveNotFound(archive_path.to_path_buf()));
        }
        Ok(Self {
            archive_path: archive_path.to_path_buf(),
            manifest_path: manifest_path.unwrap_or_else(|| sidecar_manifest_path(archive_path)),
            manifest: OnceCell::new(),
            filelist: OnceCell::new(),
        })
    }

    /// The manifest, preferring the sidecar and falling back to the copy
    /// embedded in the archive. `None` when neither is usable.
    pub fn manifest(&self) -> Option<&ArchiveManifest> {
        self.manifest
            .get_or_init(|| {
                if let Ok(manifest) = ArchiveManifest::read_json(&self.manifest_path) {
                    return Some(manifest);
                }
                let member = format!("{METADATA_DIR}/{MANIFEST_NAME}");
                match read_archive_member(&self.archive_path, &member) {
                    Ok(Some(bytes)) => ArchiveManifest::from_json(
                        String::from_utf8_lossy(&bytes).as_ref(),
                    )
                    .ok(),
                    _ => {
                        debug!("no manifest available for {}", self.archive_path.display());
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Records from the embedded file listing; empty when absent or
    /// unreadable.
    pub fn file_listing(&self) -> &[FileRecord] {
        self.filelist.get_or_init(|| {
            let member = format!("{METADATA_DIR}/{FILELIST_NAME}");
            match read_archive_member(&self.archive_path, &member) {
                Ok(Some(bytes)) => decode_filelist(&bytes).unwrap_or_default(),
                _ => Vec::new(),
            }
        })
    }

    /// One-screen summary of the archive and its metadata.
    pub fn summary(&self) -> InspectSummary {
        let size_bytes = fs::metadata(&self.archive_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let manifest = self.manifest();
        InspectSummary {
            filename: self
                .archive_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size_bytes,
            manifest_present: manifest.is_some(),
            filelist_present: !self.file_listing().is_empty(),
            id: manifest.map(|m| m.id.clone()),
            created_utc: manifest.map(|m| m.created_utc.clone()),
            event_name: manifest.and_then(|m| m.event.name.clone()),
            sha256: manifest.and_then(|m| m.archive.sha256.clone()),
            member_count: manifest.map(|m| m.archive.member_count.clone()),
        }
    }

    /// The `n` largest files by recorded size, descending.
    pub fn largest_files(&self, n: usize) -> Vec<FileRecord> {
        let mut files: Vec<FileRecord> = self
            .file_listing()
            .iter()
            .filter(|r| r.kind == EntryKind::File)
            .cloned()
            .collect();
        files.sort_by(|a, b| b.size.unwrap_or(0).cmp(&a.size.unwrap_or(0)));
        files.truncate(n);
        files
    }

    /// Per-extension file counts and byte totals, keyed by lowercase
    /// extension ("" for files without one).
    pub fn extension_stats(&self) -> BTreeMap<String, ExtensionStat> {
        let mut stats: BTreeMap<String, ExtensionStat> = BTreeMap::new();
        for record in self.file_listing() {
            if record.kind != EntryKind::File {
                continue;
            }
            let stat = stats.entry(record.ext.clone()).or_default();
            stat.count += 1;
            stat.total_bytes += record.size.unwrap_or(0);
        }
        stats
    }
}
