//! Deterministic filesystem scanner with exclusion processing.
//!
//! Walks a directory tree depth-first with child names sorted before
//! filtering and recursion, so both exclusion and ordering are independent of
//! the filesystem's iteration order. The final result set is sorted
//! lexicographically by relative path. Symlinks are leaf entries and are
//! never followed, so broken links and link cycles cannot break a scan.
//!
//! `.gitignore` support is deliberately partial: plain glob lines only.
//! Negation (`!pattern`) and full gitignore semantics are not implemented;
//! negated lines are skipped.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{ArchiveError, Result};
use crate::hashing::sha256_file;
use crate::manifest::{format_utc, EntryKind, FileRecord};

/// VCS metadata directories excluded by default, along with their contents.
pub const VCS_DIRS: [&str; 5] = [".git", ".hg", ".svn", ".bzr", "CVS"];

/// Ignore file read from the source root when requested.
pub const IGNORE_FILE_NAME: &str = ".gitignore";

/// One entry produced during a scan. Transient: never persisted.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    /// Absolute path on disk.
    pub path: PathBuf,
    /// Path relative to the source root, forward-slash separated.
    pub rel_path: String,
    pub kind: EntryKind,
}

/// Entry counts by kind, for previews and progress estimation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryCounts {
    pub files: u64,
    pub dirs: u64,
    pub symlinks: u64,
    pub total: u64,
}

/// Filesystem scanner that yields every non-excluded file, directory and
/// symlink under a root in a deterministic total order.
pub struct FileScanner {
    source_root: PathBuf,
    exclude_set: GlobSet,
    exclude_vcs: bool,
    respect_gitignore: bool,
    ignore_set: OnceLock<GlobSet>,
}

impl FileScanner {
    /// Create a scanner. The root must exist and be a directory; malformed
    /// exclusion patterns are rejected here, before any I/O on the tree.
    pub fn new(
        source_root: &Path,
        exclude_patterns: &[String],
        exclude_vcs: bool,
        respect_gitignore: bool,
    ) -> Result<Self> {
        let source_root = source_root
            .canonicalize()
            .map_err(|_| ArchiveError::InvalidSourceRoot(source_root.to_path_buf()))?;
        if !source_root.is_dir() {
            return Err(ArchiveError::InvalidSourceRoot(source_root));
        }

        let mut builder = GlobSetBuilder::new();
        for pattern in exclude_patterns {
            let glob = Glob::new(pattern).map_err(|e| ArchiveError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
            builder.add(glob);
        }
        let exclude_set = builder.build().map_err(|e| ArchiveError::InvalidPattern {
            pattern: exclude_patterns.join(", "),
            reason: e.to_string(),
        })?;

        Ok(Self {
            source_root,
            exclude_set,
            exclude_vcs,
            respect_gitignore,
            ignore_set: OnceLock::new(),
        })
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn exclude_vcs(&self) -> bool {
        self.exclude_vcs
    }

    /// Load `.gitignore` globs once, on first use. Negated lines and read
    /// errors are skipped; an unreadable file behaves like an empty one.
    fn ignore_set(&self) -> &GlobSet {
        self.ignore_set.get_or_init(|| {
            let mut builder = GlobSetBuilder::new();
            if self.respect_gitignore {
                let path = self.source_root.join(IGNORE_FILE_NAME);
                if let Ok(contents) = fs::read_to_string(&path) {
                    for line in contents.lines() {
                        let line = line.trim();
                        if line.is_empty() || line.starts_with('#') {
                            continue;
                        }
                        if line.starts_with('!') {
                            debug!("ignoring unsupported negation pattern: {line}");
                            continue;
                        }
                        match Glob::new(line.trim_end_matches('/')) {
                            Ok(glob) => {
                                builder.add(glob);
                            }
                            Err(e) => warn!("skipping invalid ignore pattern '{line}': {e}"),
                        }
                    }
                }
            }
            builder.build().unwrap_or_else(|_| GlobSet::empty())
        })
    }

    /// Exclusion test against a root-relative path. Priority order: VCS
    /// directories, caller patterns, ignore-file patterns. Patterns match
    /// both the entry name and the full relative path.
    fn is_excluded(&self, rel_path: &str, name: &str, is_dir: bool) -> bool {
        if self.exclude_vcs && is_dir {
            if VCS_DIRS.contains(&name) {
                return true;
            }
            if rel_path.split('/').any(|part| VCS_DIRS.contains(&part)) {
                return true;
            }
        }

        if self.exclude_set.is_match(rel_path) || self.exclude_set.is_match(name) {
            return true;
        }

        if self.respect_gitignore {
            let ignore = self.ignore_set();
            if ignore.is_match(rel_path) || ignore.is_match(name) {
                return true;
            }
        }

        false
    }

    fn rel_path_of(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.source_root).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    /// Scan the tree and return every entry sorted by relative path.
    ///
    /// Excluded directories are pruned before descent; their contents are
    /// never visited. Unreadable entries are logged and skipped, never fatal.
    pub fn scan(&self) -> Result<Vec<ScanEntry>> {
        let walker = WalkDir::new(&self.source_root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                match self.rel_path_of(e.path()) {
                    // The root itself is never subject to exclusion.
                    Some(rel) if rel.is_empty() => true,
                    Some(rel) => !self.is_excluded(&rel, &name, e.file_type().is_dir()),
                    None => false,
                }
            });

        let mut entries = Vec::new();
        for dirent in walker {
            let dirent = match dirent {
                Ok(d) => d,
                Err(e) => {
                    warn!("skipping unreadable entry: {e}");
                    continue;
                }
            };
            let rel_path = match self.rel_path_of(dirent.path()) {
                Some(rel) if !rel.is_empty() => rel,
                _ => continue,
            };
            let file_type = dirent.file_type();
            let kind = if file_type.is_symlink() {
                EntryKind::Symlink
            } else if file_type.is_dir() {
                EntryKind::Dir
            } else {
                EntryKind::File
            };
            entries.push(ScanEntry {
                path: dirent.into_path(),
                rel_path,
                kind,
            });
        }

        entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
        Ok(entries)
    }

    /// Count entries by kind without materializing any file records.
    pub fn count_entries(&self) -> Result<EntryCounts> {
        let mut counts = EntryCounts::default();
        for entry in self.scan()? {
            match entry.kind {
                EntryKind::File => counts.files += 1,
                EntryKind::Dir => counts.dirs += 1,
                EntryKind::Symlink => counts.symlinks += 1,
            }
            counts.total += 1;
        }
        Ok(counts)
    }

    /// Sum of file sizes in bytes, excluding symlinks and directories.
    /// Entries that cannot be stat'd are skipped.
    pub fn estimate_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for entry in self.scan()? {
            if entry.kind != EntryKind::File {
                continue;
            }
            match fs::symlink_metadata(&entry.path) {
                Ok(meta) => total += meta.len(),
                Err(e) => warn!("cannot stat {}: {e}", entry.path.display()),
            }
        }
        Ok(total)
    }

    /// Build the canonical [`FileRecord`] for one scanned entry.
    ///
    /// File content is digested in fixed 64 KiB chunks; a read failure leaves
    /// the digest empty and is reported, not fatal. A failing stat is a
    /// per-entry error the caller may skip.
    pub fn file_record(&self, entry: &ScanEntry) -> Result<FileRecord> {
        let meta =
            fs::symlink_metadata(&entry.path).map_err(|e| ArchiveError::io(e, &entry.path))?;
        self.file_record_with_digest(entry, &meta, || match entry.kind {
            EntryKind::File => match sha256_file(&entry.path) {
                Ok(digest) => Some(digest),
                Err(e) => {
                    warn!("cannot hash {}: {e}", entry.path.display());
                    None
                }
            },
            _ => None,
        })
    }

    /// Same as [`file_record`](Self::file_record), but with the content digest
    /// supplied by the caller. The archive builder uses this to digest file
    /// bytes while the tar layer consumes them, so nothing is read twice.
    pub fn file_record_with_digest(
        &self,
        entry: &ScanEntry,
        meta: &fs::Metadata,
        digest: impl FnOnce() -> Option<String>,
    ) -> Result<FileRecord> {
        let size = match entry.kind {
            EntryKind::Dir => None,
            _ => Some(meta.len()),
        };
        let mtime_utc = meta
            .modified()
            .map(format_utc)
            .unwrap_or_else(|_| format_utc(SystemTime::UNIX_EPOCH));
        let link_target = match entry.kind {
            EntryKind::Symlink => fs::read_link(&entry.path)
                .ok()
                .map(|t| t.to_string_lossy().into_owned()),
            _ => None,
        };
        let (uid, gid) = owner_ids(meta);

        FileRecord {
            path: entry.rel_path.clone(),
            kind: entry.kind,
            size,
            mode: permission_mode(meta, entry.kind),
            mtime_utc,
            sha256: digest(),
            link_target,
            uid,
            gid,
            is_executable: false,
            ext: String::new(),
        }
        .validated()
    }
}

#[cfg(unix)]
pub(crate) fn permission_mode(meta: &fs::Metadata, _kind: EntryKind) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:04o}", meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
pub(crate) fn permission_mode(_meta: &fs::Metadata, kind: EntryKind) -> String {
    match kind {
        EntryKind::Dir => "0755".to_string(),
        _ => "0644".to_string(),
    }
}

#[cfg(unix)]
pub(crate) fn owner_ids(meta: &fs::Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (meta.uid(), meta.gid())
}

#[cfg(not(unix))]
pub(crate) fn owner_ids(_meta: &fs::Metadata) -> (u32, u32) {
    (0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_root_rejected() {
        let err = FileScanner::new(Path::new("/nonexistent/permafrost"), &[], true, false);
        assert!(matches!(err, Err(ArchiveError::InvalidSourceRoot(_))));
    }

    #[test]
    fn test_malformed_pattern_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileScanner::new(dir.path(), &["[invalid".to_string()], true, false);
        assert!(matches!(err, Err(ArchiveError::InvalidPattern { .. })));
    }
}
