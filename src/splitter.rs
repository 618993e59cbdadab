//! Size-bounded split archives.
//!
//! A secondary feature layered on the scanner's output: file entries are
//! packed into parts whose estimated compressed size stays under a bound.
//! The estimate uses an extension-keyed compression-ratio table, since a
//! megabyte of JSON and a megabyte of JPEG compress very differently.
//! Split parts carry no embedded metadata; a combined checksum sidecar
//! covers all of them.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use flate2::{Compression, GzBuilder};
use tracing::{info, warn};

use crate::error::{ArchiveError, Result};
use crate::hashing::sha256_file;
use crate::manifest::EntryKind;
use crate::scanner::{FileScanner, ScanEntry};

/// Estimated compressed-size ratio for a file, keyed by lowercase extension.
pub fn compression_ratio(ext: &str) -> f64 {
    match ext {
        "txt" | "md" | "rst" | "py" | "rs" | "js" | "ts" | "c" | "h" | "cpp" | "java" | "go"
        | "json" | "csv" | "tsv" | "xml" | "html" | "css" | "yaml" | "yml" | "toml" | "log"
        | "sql" | "svg" => 0.3,
        "gz" | "bz2" | "xz" | "zst" | "zip" | "7z" | "rar" | "jpg" | "jpeg" | "png" | "gif"
        | "webp" | "mp3" | "mp4" | "mkv" | "webm" | "ogg" | "pdf" => 1.0,
        _ => 0.7,
    }
}

fn ext_of(entry: &ScanEntry) -> String {
    Path::new(&entry.rel_path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Pack files into parts bounded by `max_part_bytes` of estimated compressed
/// size. Largest files first; a part is flushed when the next file would
/// push it over the bound. Every file lands in exactly one part.
pub fn plan_parts(files: Vec<(ScanEntry, u64)>, max_part_bytes: u64) -> Vec<Vec<ScanEntry>> {
    let mut sized: Vec<(ScanEntry, u64)> = files
        .into_iter()
        .map(|(entry, size)| {
            let estimated = (size as f64 * compression_ratio(&ext_of(&entry))) as u64;
            (entry, estimated)
        })
        .collect();
    sized.sort_by(|a, b| b.1.cmp(&a.1));

    let mut parts: Vec<Vec<ScanEntry>> = Vec::new();
    let mut current: Vec<ScanEntry> = Vec::new();
    let mut current_size = 0u64;

    for (entry, estimated) in sized {
        if !current.is_empty() && current_size + estimated > max_part_bytes {
            parts.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += estimated;
        current.push(entry);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Create one or more archives from the scanner's files, split so each
/// part's estimated compressed size stays under `max_part_bytes`.
///
/// A single part keeps the base archive name; multiple parts are named
/// `<base>.partNNN.tar.gz`. Returns the created part paths in order.
pub fn create_split_archives(
    scanner: &FileScanner,
    base_archive_path: &Path,
    compression_level: u32,
    max_part_bytes: u64,
    arcname_root: Option<&str>,
) -> Result<Vec<PathBuf>> {
    if compression_level > 9 {
        return Err(ArchiveError::InvalidCompressionLevel(compression_level));
    }
    let root_name = match arcname_root {
        Some(name) => name.to_string(),
        None => scanner
            .source_root()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".to_string()),
    };

    let mut files = Vec::new();
    for entry in scanner.scan()? {
        if entry.kind != EntryKind::File {
            continue;
        }
        match fs::symlink_metadata(&entry.path) {
            Ok(meta) => files.push((entry, meta.len())),
            Err(e) => warn!("cannot stat {}: {e}", entry.rel_path),
        }
    }

    let parts = plan_parts(files, max_part_bytes);
    let single = parts.len() <= 1;
    let mut created = Vec::new();

    for (index, part) in parts.iter().enumerate() {
        let part_path = if single {
            base_archive_path.to_path_buf()
        } else {
            part_path(base_archive_path, index + 1)
        };
        info!(
            "creating part {} of {}: {}",
            index + 1,
            parts.len(),
            part_path.display()
        );
        if let Err(e) = write_part(&part_path, &root_name, part, compression_level) {
            // No partial parts persist; earlier complete parts are kept.
            let _ = fs::remove_file(&part_path);
            return Err(e);
        }
        created.push(part_path);
    }

    Ok(created)
}

fn part_path(base: &Path, number: usize) -> PathBuf {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.strip_suffix(".tar.gz").unwrap_or(&name);
    base.with_file_name(format!("{stem}.part{number:03}.tar.gz"))
}

fn write_part(
    part_path: &Path,
    root_name: &str,
    entries: &[ScanEntry],
    compression_level: u32,
) -> Result<()> {
    let file = File::create(part_path).map_err(|e| ArchiveError::io(e, part_path))?;
    let encoder = GzBuilder::new()
        .mtime(0)
        .operating_system(255)
        .write(BufWriter::new(file), Compression::new(compression_level));
    let mut tar = tar::Builder::new(encoder);
    tar.follow_symlinks(false);

    for entry in entries {
        let arcname = format!("{root_name}/{}", entry.rel_path);
        if let Err(e) = tar.append_path_with_name(&entry.path, &arcname) {
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ) {
                warn!("cannot add {} to part: {e}", entry.rel_path);
                continue;
            }
            return Err(ArchiveError::io(e, &entry.path));
        }
    }

    let encoder = tar
        .into_inner()
        .map_err(|e| ArchiveError::io(e, part_path))?;
    let mut buffered = encoder
        .finish()
        .map_err(|e| ArchiveError::io(e, part_path))?;
    std::io::Write::flush(&mut buffered).map_err(|e| ArchiveError::io(e, part_path))?;
    Ok(())
}

/// Compute per-part checksums as `(filename, sha256)` pairs.
pub fn checksum_parts(parts: &[PathBuf]) -> Result<Vec<(String, String)>> {
    let mut hashes = Vec::with_capacity(parts.len());
    for part in parts {
        let digest = sha256_file(part).map_err(|e| ArchiveError::io(e, part))?;
        let name = part
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        hashes.push((name, digest));
    }
    Ok(hashes)
}

/// Write the combined checksum sidecar and return the master hash: the
/// part's own digest for a single archive, otherwise the SHA-256 over the
/// concatenated part digests.
pub fn write_parts_sha256(path: &Path, hashes: &[(String, String)]) -> Result<String> {
    let mut body = String::new();
    for (name, digest) in hashes {
        body.push_str(&format!("{digest}  {name}\n"));
    }
    fs::write(path, body).map_err(|e| ArchiveError::io(e, path))?;

    if hashes.len() == 1 {
        return Ok(hashes[0].1.clone());
    }
    let concatenated: String = hashes.iter().map(|(_, d)| d.as_str()).collect();
    Ok(crate::hashing::sha256_bytes(concatenated.as_bytes()))
}
