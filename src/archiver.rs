//! Streaming tar+gzip archive builder.
//!
//! Consumes the scanner's ordered entries and streams them into one
//! compressed container with constant memory usage. When digesting is
//! enabled, a [`HashingWriter`] sits between the gzip encoder and the output
//! file so every compressed byte updates the archive digest as it is
//! written; file contents are digested by a [`HashingReader`] while the tar
//! layer consumes them, so no entry is ever read twice.
//!
//! The tar layer appends entries non-recursively: recursion and ordering are
//! entirely the scanner's business.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use flate2::{Compression, GzBuilder};
use tracing::{info, warn};

use crate::error::{ArchiveError, Result};
use crate::filelist::{encode_filelist, FILELIST_NAME};
use crate::hashing::{HashingReader, HashingWriter};
use crate::manifest::{
    format_utc, sidecar_manifest_path, sidecar_sha256_path, ArchiveManifest, ArchiveMetadata,
    EntryKind, EventMetadata, FileRecord, MemberCount, PerFileHashMetadata, SourceMetadata,
    SourceNormalization, VerificationMetadata, MANIFEST_VERSION,
};
use crate::meta::{collect_environment, collect_git};
use crate::scanner::FileScanner;

/// Default gzip compression level.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Fixed directory inside the archive holding the embedded metadata.
pub const METADATA_DIR: &str = "PERMAFROST";

/// Name of the embedded manifest rendering inside [`METADATA_DIR`].
pub const MANIFEST_NAME: &str = "MANIFEST.json";

/// What one build produced.
#[derive(Debug)]
pub struct BuildResult {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Archive digest, when digesting was enabled.
    pub sha256: Option<String>,
    /// Digest of the embedded file listing, when one was generated.
    pub filelist_sha256: Option<String>,
    pub files_added: u64,
    pub dirs_added: u64,
    pub symlinks_added: u64,
    /// Sidecar manifest path, when a manifest was generated.
    pub manifest_json_path: Option<PathBuf>,
    /// Plain checksum sidecar path, when digesting was enabled.
    pub sha256_file_path: Option<PathBuf>,
}

/// Streaming archive builder with deterministic entry ordering.
///
/// A per-operation value: holds no global state, so independent builds may
/// run concurrently.
pub struct ArchiveBuilder {
    output_path: PathBuf,
    compression_level: u32,
    compute_sha256: bool,
    generate_filelist: bool,
    generate_manifest: bool,
    event: EventMetadata,
}

impl ArchiveBuilder {
    /// Create a builder. An out-of-range compression level is rejected here,
    /// before any I/O.
    pub fn new(output_path: &Path, compression_level: u32) -> Result<Self> {
        if compression_level > 9 {
            return Err(ArchiveError::InvalidCompressionLevel(compression_level));
        }
        Ok(Self {
            output_path: output_path.to_path_buf(),
            compression_level,
            compute_sha256: true,
            generate_filelist: true,
            generate_manifest: true,
            event: EventMetadata::default(),
        })
    }

    /// Toggle archive-level digest computation (default: on).
    pub fn compute_sha256(mut self, enabled: bool) -> Self {
        self.compute_sha256 = enabled;
        self
    }

    /// Toggle embedded file listing generation (default: on).
    pub fn generate_filelist(mut self, enabled: bool) -> Self {
        self.generate_filelist = enabled;
        self
    }

    /// Toggle manifest generation, embedded and sidecar (default: on).
    pub fn generate_manifest(mut self, enabled: bool) -> Self {
        self.generate_manifest = enabled;
        self
    }

    /// Event context recorded in the manifest.
    pub fn event_metadata(mut self, event: EventMetadata) -> Self {
        self.event = event;
        self
    }

    /// Build the archive from the scanner's entries.
    ///
    /// `arcname_root` prefixes every member path and defaults to the source
    /// directory's name. The progress callback receives
    /// `(entries_processed, total_entries)` after each entry and runs
    /// synchronously on this thread.
    ///
    /// Any fatal error deletes the partial output before propagating; no
    /// partial archives persist.
    pub fn create_archive(
        &self,
        scanner: &FileScanner,
        arcname_root: Option<&str>,
        progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<BuildResult> {
        let result = self.build_inner(scanner, arcname_root, progress);
        if result.is_err() {
            let _ = fs::remove_file(&self.output_path);
            let _ = fs::remove_file(sidecar_manifest_path(&self.output_path));
            let _ = fs::remove_file(sidecar_sha256_path(&self.output_path));
        }
        result
    }

    fn build_inner(
        &self,
        scanner: &FileScanner,
        arcname_root: Option<&str>,
        mut progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<BuildResult> {
        let entries = scanner.scan()?;
        let total = entries.len() as u64;
        let root_name = match arcname_root {
            Some(name) => name.to_string(),
            None => scanner
                .source_root()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "archive".to_string()),
        };
        let filename = self
            .output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        info!("creating archive: {}", self.output_path.display());

        let file =
            File::create(&self.output_path).map_err(|e| ArchiveError::io(e, &self.output_path))?;
        let buffered = BufWriter::with_capacity(8 * 1024 * 1024, file);
        let sink = if self.compute_sha256 {
            HashingWriter::new(buffered)
        } else {
            HashingWriter::passthrough(buffered)
        };
        let encoder = GzBuilder::new()
            .mtime(0)
            .operating_system(255)
            .write(sink, Compression::new(self.compression_level));
        let mut tar = tar::Builder::new(encoder);
        tar.follow_symlinks(false);

        let mut records: Vec<FileRecord> = Vec::new();
        let mut counts = MemberCount::default();
        let mut processed = 0u64;

        for entry in &entries {
            let arcname = format!("{root_name}/{}", entry.rel_path);
            match entry.kind {
                EntryKind::Dir | EntryKind::Symlink => {
                    if let Err(e) = tar.append_path_with_name(&entry.path, &arcname) {
                        if is_recoverable(&e) {
                            warn!("cannot add {} to archive: {e}", entry.rel_path);
                            continue;
                        }
                        return Err(ArchiveError::io(e, &entry.path));
                    }
                    if self.generate_filelist {
                        match scanner.file_record(entry) {
                            Ok(record) => records.push(record),
                            Err(e) => warn!("cannot record {}: {e}", entry.rel_path),
                        }
                    }
                    if entry.kind == EntryKind::Dir {
                        counts.dirs += 1;
                    } else {
                        counts.symlinks += 1;
                    }
                }
                EntryKind::File => {
                    let meta = match fs::symlink_metadata(&entry.path) {
                        Ok(meta) => meta,
                        Err(e) if is_recoverable(&e) => {
                            warn!("cannot stat {}: {e}", entry.rel_path);
                            continue;
                        }
                        Err(e) => return Err(ArchiveError::io(e, &entry.path)),
                    };
                    let source = match File::open(&entry.path) {
                        Ok(f) => f,
                        Err(e) if is_recoverable(&e) => {
                            warn!("cannot open {}: {e}", entry.rel_path);
                            continue;
                        }
                        Err(e) => return Err(ArchiveError::io(e, &entry.path)),
                    };
                    let mut header = tar::Header::new_gnu();
                    header.set_metadata(&meta);

                    if self.generate_filelist {
                        let mut reader = HashingReader::new(source);
                        tar.append_data(&mut header, &arcname, &mut reader)
                            .map_err(|e| ArchiveError::io(e, &entry.path))?;
                        let (digest, _) = reader.finalize();
                        match scanner.file_record_with_digest(entry, &meta, || Some(digest)) {
                            Ok(record) => records.push(record),
                            Err(e) => warn!("cannot record {}: {e}", entry.rel_path),
                        }
                    } else {
                        let mut reader = source;
                        tar.append_data(&mut header, &arcname, &mut reader)
                            .map_err(|e| ArchiveError::io(e, &entry.path))?;
                    }
                    counts.files += 1;
                }
            }
            processed += 1;
            if let Some(cb) = progress.as_mut() {
                cb(processed, total);
            }
        }

        // Side-files go in last, under the fixed metadata directory.
        let mut filelist_sha256 = None;
        if self.generate_filelist {
            let (bytes, digest) = encode_filelist(&records)?;
            append_metadata_entry(&mut tar, &format!("{METADATA_DIR}/{FILELIST_NAME}"), &bytes)?;
            filelist_sha256 = Some(digest);
        }

        let mut manifest = if self.generate_manifest {
            let manifest = ArchiveManifest {
                manifest_version: MANIFEST_VERSION.to_string(),
                created_utc: format_utc(SystemTime::now()),
                id: archive_id(&filename),
                source: SourceMetadata {
                    root: scanner.source_root().display().to_string(),
                    normalization: SourceNormalization {
                        exclude_vcs: scanner.exclude_vcs(),
                        ..Default::default()
                    },
                },
                event: self.event.clone(),
                environment: collect_environment(),
                git: collect_git(scanner.source_root()),
                archive: ArchiveMetadata {
                    format: "tar+gzip".to_string(),
                    filename: filename.clone(),
                    // Unknowable until the archive is sealed; the embedded
                    // rendering carries them as null.
                    size_bytes: None,
                    sha256: None,
                    member_count: counts.clone(),
                },
                verification: VerificationMetadata {
                    per_file_hash: PerFileHashMetadata {
                        algorithm: "sha256".to_string(),
                        filelist_sha256: filelist_sha256.clone(),
                    },
                },
                files: Vec::new(),
            };
            let body = manifest.to_json()?;
            append_metadata_entry(
                &mut tar,
                &format!("{METADATA_DIR}/{MANIFEST_NAME}"),
                body.as_bytes(),
            )?;
            Some(manifest)
        } else {
            None
        };

        // Seal the container: tar footer, gzip trailer, digest.
        let encoder = tar
            .into_inner()
            .map_err(|e| ArchiveError::io(e, &self.output_path))?;
        let sink = encoder
            .finish()
            .map_err(|e| ArchiveError::io(e, &self.output_path))?;
        let (mut buffered, sha256, _) = sink.finalize();
        buffered
            .flush()
            .map_err(|e| ArchiveError::io(e, &self.output_path))?;
        drop(buffered);

        let size_bytes = fs::metadata(&self.output_path)
            .map_err(|e| ArchiveError::io(e, &self.output_path))?
            .len();

        // Only now are the self-referential fields knowable.
        let mut manifest_json_path = None;
        if let Some(manifest) = manifest.as_mut() {
            manifest.archive.size_bytes = Some(size_bytes);
            manifest.archive.sha256 = sha256.clone();
            let path = sidecar_manifest_path(&self.output_path);
            manifest.write_json(&path)?;
            manifest_json_path = Some(path);
        }
        let mut sha256_file_path = None;
        if let Some(digest) = &sha256 {
            let path = sidecar_sha256_path(&self.output_path);
            fs::write(&path, format!("{digest}  {filename}\n"))
                .map_err(|e| ArchiveError::io(e, &path))?;
            sha256_file_path = Some(path);
        }

        info!(
            "archive created: {} files, {} dirs, {} symlinks, {} bytes",
            counts.files, counts.dirs, counts.symlinks, size_bytes
        );

        Ok(BuildResult {
            path: self.output_path.clone(),
            size_bytes,
            sha256,
            filelist_sha256,
            files_added: counts.files,
            dirs_added: counts.dirs,
            symlinks_added: counts.symlinks,
            manifest_json_path,
            sha256_file_path,
        })
    }
}

/// Archive identifier: the archive filename without its `.tar.gz` suffix.
fn archive_id(filename: &str) -> String {
    filename
        .strip_suffix(".tar.gz")
        .unwrap_or(filename)
        .to_string()
}

fn is_recoverable(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
    )
}

/// Append one in-memory side-file with a neutral, reproducible header.
fn append_metadata_entry<W: Write>(
    tar: &mut tar::Builder<W>,
    path: &str,
    data: &[u8],
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);
    tar.append_data(&mut header, path, data)?;
    Ok(())
}
