//! Two-level archive integrity verification.
//!
//! **Quick** checks structure and hashes in seconds without decompressing
//! the whole archive: sidecar manifest parses, the plain checksum sidecar
//! matches a fresh streaming digest, the recorded size matches the file on
//! disk, and the stored file-listing digest matches the copy embedded in the
//! archive (only that one member is decompressed).
//!
//! **Deep** runs the quick checks first, then streams the entire archive
//! once, re-hashing every member whose record carries a digest.
//!
//! Verifiers are stateless and read-only; every call is independent.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use flate2::read::GzDecoder;
use serde::Serialize;
use tracing::debug;

use crate::archiver::METADATA_DIR;
use crate::error::{ArchiveError, Result};
use crate::filelist::{decode_filelist, FILELIST_NAME};
use crate::hashing::{sha256_bytes, sha256_file, sha256_reader};
use crate::manifest::{
    sidecar_manifest_path, sidecar_sha256_path, ArchiveManifest, MANIFEST_VERSION,
};

/// Verification level that was run.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerifyLevel {
    Quick,
    Deep,
}

/// Outcome of one verification call.
///
/// Appending an error flips `passed` to false; warnings never do. A result
/// that only ran quick checks reports no `files_verified`.
#[derive(Serialize, Debug, Clone)]
pub struct VerificationResult {
    pub passed: bool,
    pub level: VerifyLevel,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub checks_performed: u32,
    pub checks_passed: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_verified: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_verified: Option<u64>,
    pub elapsed_seconds: f64,
}

impl VerificationResult {
    pub fn new(level: VerifyLevel) -> Self {
        Self {
            passed: true,
            level,
            errors: Vec::new(),
            warnings: Vec::new(),
            checks_performed: 0,
            checks_passed: 0,
            files_verified: None,
            bytes_verified: None,
            elapsed_seconds: 0.0,
        }
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
        self.passed = false;
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Record one check. A failing check with a message also appends an
    /// error.
    pub fn add_check(&mut self, ok: bool, error: Option<String>) {
        self.checks_performed += 1;
        if ok {
            self.checks_passed += 1;
        } else if let Some(message) = error {
            self.add_error(message);
        } else {
            self.passed = false;
        }
    }

    /// Deep-verification throughput in MB/s, when bytes were verified.
    pub fn throughput_mbps(&self) -> Option<f64> {
        let bytes = self.bytes_verified?;
        if self.elapsed_seconds <= 0.0 {
            return None;
        }
        Some(bytes as f64 / (1024.0 * 1024.0) / self.elapsed_seconds)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn finish(&mut self, started: Instant) {
        self.elapsed_seconds = (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;
    }
}

/// Options for [`ArchiveVerifier::verify_deep`].
#[derive(Default)]
pub struct DeepOptions<'a> {
    /// Stop at the first failure instead of accumulating every problem.
    pub fail_fast: bool,
    /// Called after each verified file with
    /// `(files_verified, total_expected, current_path)`. Runs synchronously
    /// on the caller's thread.
    pub progress: Option<&'a mut dyn FnMut(u64, u64, &str)>,
    /// Checked between per-entry iterations; when set, verification stops
    /// and returns the partial result accumulated so far.
    pub cancel: Option<&'a AtomicBool>,
}

/// Read-only integrity checker for one archive.
pub struct ArchiveVerifier {
    archive_path: PathBuf,
    manifest_path: PathBuf,
    sha256_path: PathBuf,
}

impl ArchiveVerifier {
    /// Point a verifier at an archive. The archive file must exist; the
    /// sidecar paths default to `<archive>.MANIFEST.json` and
    /// `<archive>.sha256` unless a manifest override is given.
    pub fn new(archive_path: &Path, manifest_path: Option<PathBuf>) -> Result<Self> {
        if !archive_path.exists() {
            return Err(ArchiveError::ArchiveNotFound(archive_path.to_path_buf()));
        }
        Ok(Self {
            archive_path: archive_path.to_path_buf(),
            manifest_path: manifest_path.unwrap_or_else(|| sidecar_manifest_path(archive_path)),
            sha256_path: sidecar_sha256_path(archive_path),
        })
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn sha256_path(&self) -> &Path {
        &self.sha256_path
    }

    /// Quick verification: structure and hashes only.
    pub fn verify_quick(&self) -> VerificationResult {
        let started = Instant::now();
        let mut result = VerificationResult::new(VerifyLevel::Quick);
        self.run_quick_checks(&mut result);
        result.finish(started);
        result
    }

    /// Run the quick checks into `result`, returning the parsed manifest
    /// when the non-fatal path was reached. A manifest that is missing or
    /// unparseable, and a checksum-sidecar mismatch, are fatal: remaining
    /// checks are skipped and `None` is returned.
    fn run_quick_checks(&self, result: &mut VerificationResult) -> Option<ArchiveManifest> {
        // Check 1: sidecar manifest exists and parses.
        if !self.manifest_path.exists() {
            result.add_check(
                false,
                Some(format!(
                    "Manifest file not found: {}",
                    self.manifest_path.display()
                )),
            );
            return None;
        }
        let manifest = match ArchiveManifest::read_json(&self.manifest_path) {
            Ok(manifest) => manifest,
            Err(e) => {
                result.add_check(false, Some(format!("Invalid manifest: {e}")));
                return None;
            }
        };
        result.add_check(true, None);
        if manifest.manifest_version != MANIFEST_VERSION {
            result.add_warning(format!(
                "Unrecognized manifest version '{}' (this tool knows '{}')",
                manifest.manifest_version, MANIFEST_VERSION
            ));
        }

        // Check 2: plain checksum sidecar against a fresh streaming digest.
        if self.sha256_path.exists() {
            match self.check_sha256_sidecar(result) {
                Ok(true) => {}
                // Mismatch or unreadable archive: nothing else is trustworthy.
                _ => return None,
            }
        } else {
            result.add_warning(format!(
                "SHA256 checksum file not found: {}",
                self.sha256_path.display()
            ));
        }

        // Check 3: recorded size against the file on disk.
        match fs::metadata(&self.archive_path) {
            Ok(meta) => match manifest.archive.size_bytes {
                Some(expected) => {
                    let actual = meta.len();
                    result.add_check(
                        expected == actual,
                        Some(format!(
                            "Archive size mismatch: manifest records {expected} bytes, found {actual}"
                        )),
                    );
                }
                None => result.add_warning("Manifest does not record the archive size".to_string()),
            },
            Err(e) => {
                result.add_check(false, Some(format!("Cannot stat archive: {e}")));
                return Some(manifest);
            }
        }

        // Check 4: stored file-listing digest against the embedded copy.
        if let Some(expected) = manifest
            .verification
            .per_file_hash
            .filelist_sha256
            .as_deref()
        {
            let member = format!("{METADATA_DIR}/{FILELIST_NAME}");
            match self.read_member(&member) {
                Ok(Some(bytes)) => {
                    let actual = sha256_bytes(&bytes);
                    result.add_check(
                        actual == expected,
                        Some(format!(
                            "FILELIST hash mismatch: expected {expected}, actual {actual}"
                        )),
                    );
                }
                Ok(None) => result.add_check(
                    false,
                    Some(format!("FILELIST not found in archive (expected {member})")),
                ),
                Err(e) => result.add_check(false, Some(format!("Cannot read archive: {e}"))),
            }
        }

        Some(manifest)
    }

    /// Returns `Ok(true)` when the sidecar digest matches, `Ok(false)` on
    /// mismatch, `Err` when the archive could not be hashed at all.
    fn check_sha256_sidecar(&self, result: &mut VerificationResult) -> Result<bool> {
        let contents = match fs::read_to_string(&self.sha256_path) {
            Ok(contents) => contents,
            Err(e) => {
                result.add_check(false, Some(format!("Cannot read checksum sidecar: {e}")));
                return Ok(false);
            }
        };
        let expected = match contents.split_whitespace().next() {
            Some(token) if token.len() == 64 => token.to_ascii_lowercase(),
            _ => {
                result.add_check(
                    false,
                    Some(format!(
                        "Malformed checksum sidecar: {}",
                        self.sha256_path.display()
                    )),
                );
                return Ok(false);
            }
        };
        let actual = match sha256_file(&self.archive_path) {
            Ok(digest) => digest,
            Err(e) => {
                result.add_check(false, Some(format!("Cannot read archive: {e}")));
                return Err(ArchiveError::io(e, &self.archive_path));
            }
        };
        let ok = actual == expected;
        result.add_check(
            ok,
            Some(format!(
                "SHA256 mismatch for {}: expected {expected}, actual {actual}",
                self.archive_filename()
            )),
        );
        Ok(ok)
    }

    /// Deep verification: quick checks plus a per-file content hash pass.
    pub fn verify_deep(&self, mut opts: DeepOptions<'_>) -> VerificationResult {
        let started = Instant::now();
        let mut result = VerificationResult::new(VerifyLevel::Deep);

        let manifest = self.run_quick_checks(&mut result);
        let quick_fatal = manifest.is_none();
        if quick_fatal || (opts.fail_fast && !result.passed) {
            // Nothing per-file to trust (or the caller asked to stop early).
            result.finish(started);
            return result;
        }

        let member = format!("{METADATA_DIR}/{FILELIST_NAME}");
        let records = match self.read_member(&member) {
            Ok(Some(bytes)) => match decode_filelist(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    result.add_check(false, Some(format!("Invalid FILELIST: {e}")));
                    result.finish(started);
                    return result;
                }
            },
            Ok(None) => {
                result.add_check(
                    false,
                    Some(format!(
                        "FILELIST not found in archive (expected {member}); deep verification needs the embedded file listing"
                    )),
                );
                result.finish(started);
                return result;
            }
            Err(e) => {
                result.add_check(false, Some(format!("Cannot read archive: {e}")));
                result.finish(started);
                return result;
            }
        };

        // Expected content digests, keyed by root-relative path.
        let mut expected: std::collections::BTreeMap<String, String> = records
            .into_iter()
            .filter_map(|r| r.sha256.map(|digest| (r.path, digest)))
            .collect();
        let total = expected.len() as u64;

        let mut files_verified = 0u64;
        let mut bytes_verified = 0u64;
        let mut completed = true;

        let walk = (|| -> Result<()> {
            let file =
                File::open(&self.archive_path).map_err(|e| ArchiveError::io(e, &self.archive_path))?;
            let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
            for entry in archive.entries().map_err(|e| self.malformed(e))? {
                if let Some(cancel) = opts.cancel {
                    if cancel.load(Ordering::Relaxed) {
                        result.add_warning(format!(
                            "Deep verification cancelled after {files_verified} of {total} files"
                        ));
                        completed = false;
                        return Ok(());
                    }
                }
                let mut entry = entry.map_err(|e| self.malformed(e))?;
                let path = entry.path().map_err(|e| self.malformed(e))?.into_owned();
                let rel = match strip_archive_root(&path) {
                    Some((first, rel)) if first != METADATA_DIR => rel,
                    _ => continue,
                };
                let Some(want) = expected.remove(&rel) else {
                    continue;
                };
                let (actual, n) =
                    sha256_reader(&mut entry).map_err(|e| ArchiveError::io(e, &self.archive_path))?;
                files_verified += 1;
                bytes_verified += n;
                let ok = actual == want;
                result.add_check(
                    ok,
                    Some(format!(
                        "SHA256 mismatch for file '{rel}': expected {want}, actual {actual}"
                    )),
                );
                if let Some(cb) = opts.progress.as_mut() {
                    cb(files_verified, total, &rel);
                }
                if !ok && opts.fail_fast {
                    completed = false;
                    return Ok(());
                }
            }
            Ok(())
        })();

        if let Err(e) = walk {
            result.add_check(false, Some(format!("Cannot read archive: {e}")));
            completed = false;
        }

        // Anything still expected was promised by the listing but never seen.
        if completed {
            for path in expected.keys() {
                result.add_check(
                    false,
                    Some(format!("file '{path}' listed in FILELIST but missing from archive")),
                );
            }
        }

        result.files_verified = Some(files_verified);
        result.bytes_verified = Some(bytes_verified);
        result.finish(started);
        result
    }

    /// Extract one member's raw bytes, decompressing only as far as needed.
    fn read_member(&self, member: &str) -> Result<Option<Vec<u8>>> {
        read_archive_member(&self.archive_path, member)
    }

    fn malformed(&self, e: std::io::Error) -> ArchiveError {
        ArchiveError::MalformedArchive {
            path: self.archive_path.clone(),
            reason: e.to_string(),
        }
    }

    fn archive_filename(&self) -> String {
        self.archive_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Extract one member's raw bytes from a tar.gz archive, stopping as soon as
/// the member has been read. Shared with the inspector.
pub(crate) fn read_archive_member(archive_path: &Path, member: &str) -> Result<Option<Vec<u8>>> {
    let malformed = |e: std::io::Error| ArchiveError::MalformedArchive {
        path: archive_path.to_path_buf(),
        reason: e.to_string(),
    };
    let file = File::open(archive_path).map_err(|e| ArchiveError::io(e, archive_path))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    for entry in archive.entries().map_err(malformed)? {
        let mut entry = entry.map_err(malformed)?;
        let path = entry.path().map_err(malformed)?;
        if path == Path::new(member) {
            let mut bytes = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut bytes).map_err(malformed)?;
            return Ok(Some(bytes));
        }
    }
    debug!("member {member} not present in {}", archive_path.display());
    Ok(None)
}

/// Split an archive member path into its root prefix and the remainder as a
/// forward-slash relative path.
fn strip_archive_root(path: &Path) -> Option<(String, String)> {
    let mut components = path.components();
    let first = components
        .next()?
        .as_os_str()
        .to_string_lossy()
        .into_owned();
    let rest: Vec<String> = components
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if rest.is_empty() {
        return None;
    }
    Some((first, rest.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_starts_clean() {
        let result = VerificationResult::new(VerifyLevel::Quick);
        assert!(result.passed);
        assert_eq!(result.checks_performed, 0);
        assert_eq!(result.files_verified, None);
    }

    #[test]
    fn test_add_error_flips_passed() {
        let mut result = VerificationResult::new(VerifyLevel::Quick);
        result.add_error("boom");
        assert!(!result.passed);
        assert_eq!(result.errors, vec!["boom".to_string()]);
    }

    #[test]
    fn test_warnings_never_flip_passed() {
        let mut result = VerificationResult::new(VerifyLevel::Quick);
        result.add_warning("odd but fine");
        assert!(result.passed);
    }

    #[test]
    fn test_add_check_counts() {
        let mut result = VerificationResult::new(VerifyLevel::Deep);
        result.add_check(true, None);
        result.add_check(false, Some("check failed".to_string()));
        assert_eq!(result.checks_performed, 2);
        assert_eq!(result.checks_passed, 1);
        assert!(!result.passed);
        assert_eq!(result.errors, vec!["check failed".to_string()]);
    }

    #[test]
    fn test_nonexistent_archive_rejected() {
        let err = ArchiveVerifier::new(Path::new("/nonexistent/archive.tar.gz"), None);
        assert!(matches!(err, Err(ArchiveError::ArchiveNotFound(_))));
    }

    #[test]
    fn test_strip_archive_root() {
        assert_eq!(
            strip_archive_root(Path::new("root/src/main.rs")),
            Some(("root".to_string(), "src/main.rs".to_string()))
        );
        assert_eq!(strip_archive_root(Path::new("root")), None);
    }
}
