//! Manifest schema, validation and serialization.
//!
//! One [`ArchiveManifest`] describes one archive. The same struct is rendered
//! twice: an **embedded** copy written inside the archive, where the two
//! self-referential fields (`archive.size_bytes`, `archive.sha256`) are
//! unknowable and serialized as explicit `null`, and a **sidecar** copy
//! written beside the archive with every field populated. Apart from those
//! two fields the renderings are identical.
//!
//! All other absent optional fields are omitted from output entirely.
//! Readers tolerate unknown extra fields, so newer writers stay compatible.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, Result};

/// Manifest schema version written by this crate.
pub const MANIFEST_VERSION: &str = "1.0";

/// Kind of a filesystem entry, as recorded in listings and manifests.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Dir => "dir",
            EntryKind::Symlink => "symlink",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(EntryKind::File),
            "dir" => Ok(EntryKind::Dir),
            "symlink" => Ok(EntryKind::Symlink),
            other => Err(ArchiveError::InvalidField {
                field: "type",
                reason: format!("unknown entry kind '{other}'"),
            }),
        }
    }
}

fn sha256_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-fA-F0-9]{64}$").expect("sha256 regex"))
}

fn mode_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-7]{3,4}$").expect("mode regex"))
}

/// Reject absolute paths; relative paths pass through unchanged.
pub fn validate_relpath(path: String) -> Result<String> {
    if Path::new(&path).is_absolute() || path.starts_with('/') {
        return Err(ArchiveError::InvalidField {
            field: "path",
            reason: format!("must be relative, not absolute: {path}"),
        });
    }
    Ok(path)
}

/// Normalize a permission mode string to zero-padded 4-digit octal.
///
/// Accepts `"644"`, `"0644"` and the `"0o644"` prefixed variant; rejects any
/// digit outside 0-7.
pub fn normalize_mode(mode: &str) -> Result<String> {
    let stripped = mode.strip_prefix("0o").unwrap_or(mode);
    if !mode_re().is_match(stripped) {
        return Err(ArchiveError::InvalidField {
            field: "mode",
            reason: format!("must be octal (e.g. 0644): {mode}"),
        });
    }
    Ok(format!("{:0>4}", stripped))
}

/// Validate a SHA-256 hex string and normalize it to lowercase.
pub fn normalize_sha256(digest: &str) -> Result<String> {
    if !sha256_re().is_match(digest) {
        return Err(ArchiveError::InvalidField {
            field: "sha256",
            reason: format!("must be 64 hexadecimal characters, got '{digest}'"),
        });
    }
    Ok(digest.to_ascii_lowercase())
}

/// Format a filesystem timestamp as ISO-8601 UTC with seconds precision.
pub fn format_utc(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Lowercase final extension of a relative path, without the dot.
/// Empty for paths with no extension.
fn extension_of(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// Canonical per-entry metadata captured at archive time.
///
/// One row of the file listing. Paths are always relative with forward
/// slashes; the mode is a 4-digit octal string; any digest present is 64
/// lowercase hex characters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileRecord {
    /// Relative path from the source root, forward-slash separated.
    pub path: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    /// Size in bytes; `None` for directories.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Permission mode as zero-padded 4-digit octal.
    pub mode: String,
    /// Last modification time, ISO-8601 UTC.
    pub mtime_utc: String,
    /// Content digest; `None` for directories, symlinks and unreadable files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Symlink target, symlinks only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_target: Option<String>,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    /// Derived: regular file with any execute bit set.
    #[serde(default)]
    pub is_executable: bool,
    /// Derived: lowercase final extension, empty if none.
    #[serde(default)]
    pub ext: String,
}

impl FileRecord {
    /// Validate and normalize every field, recomputing the derived ones.
    /// This is the single construction gate: the scanner and the listing
    /// reader both route raw records through here.
    pub fn validated(mut self) -> Result<Self> {
        self.path = validate_relpath(self.path)?;
        self.mode = normalize_mode(&self.mode)?;
        if let Some(digest) = self.sha256.take() {
            self.sha256 = Some(normalize_sha256(&digest)?);
        }
        let mode_bits = u32::from_str_radix(&self.mode, 8).unwrap_or(0);
        self.is_executable = self.kind == EntryKind::File && mode_bits & 0o111 != 0;
        self.ext = match self.kind {
            EntryKind::File => extension_of(&self.path),
            _ => String::new(),
        };
        Ok(self)
    }
}

fn default_path_separator() -> String {
    "/".to_string()
}

fn default_unicode_normalization() -> String {
    "NFC".to_string()
}

fn default_ordering() -> String {
    "lexicographic".to_string()
}

fn default_true() -> bool {
    true
}

/// Source path normalization parameters recorded for reproducibility.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SourceNormalization {
    #[serde(default = "default_path_separator")]
    pub path_separator: String,
    #[serde(default = "default_unicode_normalization")]
    pub unicode_normalization: String,
    #[serde(default = "default_ordering")]
    pub ordering: String,
    #[serde(default = "default_true")]
    pub exclude_vcs: bool,
}

impl Default for SourceNormalization {
    fn default() -> Self {
        Self {
            path_separator: default_path_separator(),
            unicode_normalization: default_unicode_normalization(),
            ordering: default_ordering(),
            exclude_vcs: true,
        }
    }
}

/// Where the archive came from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SourceMetadata {
    /// Absolute path to the source root at archive time.
    pub root: String,
    #[serde(default)]
    pub normalization: SourceNormalization,
}

/// Free-form event context: what prompted this archive.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EventMetadata {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contacts: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SystemMetadata {
    pub os: String,
    pub os_version: String,
    pub hostname: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolsMetadata {
    /// Version of the tool that produced the archive.
    pub version: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EnvironmentMetadata {
    pub system: SystemMetadata,
    pub tools: ToolsMetadata,
}

/// Git snapshot of the source root. Everything except `present` is optional;
/// a missing repository (or a missing `git` binary) is `present: false`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct GitMetadata {
    pub present: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirty: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_origin_url: Option<String>,
}

/// Archive member counts by kind.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct MemberCount {
    pub files: u64,
    pub dirs: u64,
    #[serde(default)]
    pub symlinks: u64,
}

fn default_format() -> String {
    "tar+gzip".to_string()
}

/// Metadata about the archive file itself.
///
/// `size_bytes` and `sha256` are the two self-referential fields: unknowable
/// while the archive is still being written, so the embedded rendering
/// deliberately emits them as `null` (never omitted), and the sidecar
/// rendering carries the real values.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArchiveMetadata {
    #[serde(default = "default_format")]
    pub format: String,
    pub filename: String,
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub member_count: MemberCount,
}

fn default_algorithm() -> String {
    "sha256".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PerFileHashMetadata {
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Digest of the compressed file listing embedded in the archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filelist_sha256: Option<String>,
}

impl Default for PerFileHashMetadata {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            filelist_sha256: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct VerificationMetadata {
    #[serde(default)]
    pub per_file_hash: PerFileHashMetadata,
}

/// The structured document describing one archive.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ArchiveManifest {
    pub manifest_version: String,
    /// Creation timestamp, ISO-8601 UTC.
    pub created_utc: String,
    /// Unique archive identifier (the archive base name).
    pub id: String,
    pub source: SourceMetadata,
    #[serde(default)]
    pub event: EventMetadata,
    pub environment: EnvironmentMetadata,
    #[serde(default)]
    pub git: GitMetadata,
    pub archive: ArchiveMetadata,
    #[serde(default)]
    pub verification: VerificationMetadata,
    /// Optional embedded per-file records. The file listing is the canonical
    /// table; this stays empty unless a caller wants a self-contained manifest.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<FileRecord>,
}

impl ArchiveManifest {
    /// The embedded rendering: identical to `self` except that the two
    /// self-referential archive fields are nulled out.
    pub fn embedded(&self) -> Self {
        let mut copy = self.clone();
        copy.archive.size_bytes = None;
        copy.archive.sha256 = None;
        copy
    }

    /// Serialize to pretty-printed JSON (the on-disk MANIFEST.json form).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to YAML, the human-editable rendering.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        let mut body = self.to_json()?;
        body.push('\n');
        fs::write(path, body).map_err(|e| ArchiveError::io(e, path))
    }

    pub fn read_json(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path).map_err(|e| ArchiveError::io(e, path))?;
        Self::from_json(&body)
    }
}

/// Default sidecar manifest path for an archive: `<archive>.MANIFEST.json`.
pub fn sidecar_manifest_path(archive_path: &Path) -> PathBuf {
    sibling_with_suffix(archive_path, ".MANIFEST.json")
}

/// Default checksum sidecar path for an archive: `<archive>.sha256`.
pub fn sidecar_sha256_path(archive_path: &Path) -> PathBuf {
    sibling_with_suffix(archive_path, ".sha256")
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> FileRecord {
        FileRecord {
            path: "src/main.rs".to_string(),
            kind: EntryKind::File,
            size: Some(1024),
            mode: "0644".to_string(),
            mtime_utc: "2025-01-01T00:00:00Z".to_string(),
            sha256: Some("a".repeat(64)),
            link_target: None,
            uid: 1000,
            gid: 1000,
            is_executable: false,
            ext: String::new(),
        }
    }

    fn sample_manifest() -> ArchiveManifest {
        ArchiveManifest {
            manifest_version: MANIFEST_VERSION.to_string(),
            created_utc: "2025-01-01T00:00:00Z".to_string(),
            id: "project_2025-01-01".to_string(),
            source: SourceMetadata {
                root: "/home/user/project".to_string(),
                normalization: SourceNormalization::default(),
            },
            event: EventMetadata {
                event_type: Some("milestone".to_string()),
                name: Some("v1.0 release".to_string()),
                notes: vec!["first stable".to_string()],
                contacts: vec![],
            },
            environment: EnvironmentMetadata {
                system: SystemMetadata {
                    os: "Linux".to_string(),
                    os_version: "6.1".to_string(),
                    hostname: "workstation".to_string(),
                },
                tools: ToolsMetadata {
                    version: "0.1.0".to_string(),
                },
            },
            git: GitMetadata {
                present: true,
                commit: Some("deadbeef".to_string()),
                branch: Some("main".to_string()),
                tag: None,
                dirty: Some(false),
                remote_origin_url: None,
            },
            archive: ArchiveMetadata {
                format: "tar+gzip".to_string(),
                filename: "project_2025-01-01.tar.gz".to_string(),
                size_bytes: Some(4096),
                sha256: Some("b".repeat(64)),
                member_count: MemberCount {
                    files: 3,
                    dirs: 1,
                    symlinks: 0,
                },
            },
            verification: VerificationMetadata {
                per_file_hash: PerFileHashMetadata {
                    algorithm: "sha256".to_string(),
                    filelist_sha256: Some("c".repeat(64)),
                },
            },
            files: vec![],
        }
    }

    #[test]
    fn test_absolute_path_rejected() {
        let mut record = sample_record();
        record.path = "/abs/path".to_string();
        assert!(record.validated().is_err());
    }

    #[test]
    fn test_mode_normalization() {
        assert_eq!(normalize_mode("644").unwrap(), "0644");
        assert_eq!(normalize_mode("0644").unwrap(), "0644");
        assert_eq!(normalize_mode("0o644").unwrap(), "0644");
        assert_eq!(normalize_mode("1777").unwrap(), "1777");
    }

    #[test]
    fn test_invalid_mode_rejected() {
        assert!(normalize_mode("0999").is_err());
        assert!(normalize_mode("64").is_err());
        assert!(normalize_mode("rwxr-xr-x").is_err());
    }

    #[test]
    fn test_sha256_normalized_to_lowercase() {
        let upper = "ABCD".repeat(16);
        assert_eq!(normalize_sha256(&upper).unwrap(), "abcd".repeat(16));
    }

    #[test]
    fn test_sha256_wrong_length_rejected() {
        assert!(normalize_sha256("abc123").is_err());
        assert!(normalize_sha256(&"a".repeat(65)).is_err());
        assert!(normalize_sha256(&"g".repeat(64)).is_err());
    }

    #[test]
    fn test_derived_fields() {
        let mut record = sample_record();
        record.path = "bin/run.SH".to_string();
        record.mode = "0755".to_string();
        let record = record.validated().unwrap();
        assert!(record.is_executable);
        assert_eq!(record.ext, "sh");

        let mut dir = sample_record();
        dir.kind = EntryKind::Dir;
        dir.size = None;
        dir.sha256 = None;
        dir.mode = "0755".to_string();
        let dir = dir.validated().unwrap();
        assert!(!dir.is_executable);
        assert_eq!(dir.ext, "");
    }

    #[test]
    fn test_manifest_json_roundtrip() {
        let manifest = sample_manifest();
        let json = manifest.to_json().unwrap();
        let back = ArchiveManifest::from_json(&json).unwrap();
        assert_eq!(manifest, back);
    }

    #[test]
    fn test_manifest_yaml_roundtrip() {
        let manifest = sample_manifest();
        let yaml = manifest.to_yaml().unwrap();
        let back = ArchiveManifest::from_yaml(&yaml).unwrap();
        assert_eq!(manifest, back);
    }

    #[test]
    fn test_embedded_rendering_nulls_self_referential_fields() {
        let manifest = sample_manifest();
        let embedded = manifest.embedded();

        assert_eq!(embedded.archive.size_bytes, None);
        assert_eq!(embedded.archive.sha256, None);

        // Everything else is identical.
        let mut expected = manifest.clone();
        expected.archive.size_bytes = None;
        expected.archive.sha256 = None;
        assert_eq!(embedded, expected);

        // The nulled fields are emitted explicitly, not omitted.
        let json = embedded.to_json().unwrap();
        assert!(json.contains("\"size_bytes\": null"));
        assert!(json.contains("\"sha256\": null"));
    }

    #[test]
    fn test_absent_optionals_are_omitted() {
        let mut manifest = sample_manifest();
        manifest.git = GitMetadata {
            present: false,
            ..Default::default()
        };
        let json = manifest.to_json().unwrap();
        assert!(!json.contains("\"commit\""));
        assert!(!json.contains("\"remote_origin_url\""));
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let mut value: serde_json::Value =
            serde_json::from_str(&sample_manifest().to_json().unwrap()).unwrap();
        value["future_field"] = serde_json::json!("ignored");
        let parsed: ArchiveManifest = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.id, "project_2025-01-01");
    }

    #[test]
    fn test_sidecar_paths() {
        let archive = Path::new("/backups/proj.tar.gz");
        assert_eq!(
            sidecar_manifest_path(archive),
            Path::new("/backups/proj.tar.gz.MANIFEST.json")
        );
        assert_eq!(
            sidecar_sha256_path(archive),
            Path::new("/backups/proj.tar.gz.sha256")
        );
    }
}
