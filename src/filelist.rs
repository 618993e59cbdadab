//! The file listing: one gzip-compressed CSV table of [`FileRecord`]s.
//!
//! Column order is fixed, rows are sorted lexicographically by relative path,
//! and the gzip header is pinned (mtime 0) so that identical records always
//! produce byte-identical output. The digest returned by the encoder is the
//! SHA-256 of the *compressed* bytes; it is stored in the manifest and checked
//! against the copy embedded in the archive during verification.

use std::fs;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};

use crate::error::{ArchiveError, Result};
use crate::hashing::sha256_bytes;
use crate::manifest::{EntryKind, FileRecord};

/// Fixed column order of the listing document.
pub const FILELIST_COLUMNS: [&str; 11] = [
    "relpath",
    "type",
    "size_bytes",
    "mode_octal",
    "uid",
    "gid",
    "mtime_utc",
    "sha256",
    "link_target",
    "is_executable",
    "ext",
];

/// Name of the listing file inside the archive's metadata directory.
pub const FILELIST_NAME: &str = "FILELIST.csv.gz";

/// Encode records into the compressed listing document.
///
/// Rows are sorted by relative path before writing, so callers do not need
/// to pre-sort. Returns the compressed bytes and their SHA-256 digest.
pub fn encode_filelist(records: &[FileRecord]) -> Result<(Vec<u8>, String)> {
    let mut sorted: Vec<&FileRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut csv_bytes = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut csv_bytes);
        writer.write_record(FILELIST_COLUMNS)?;
        for record in sorted {
            let size = record.size.map(|s| s.to_string()).unwrap_or_default();
            let uid = record.uid.to_string();
            let gid = record.gid.to_string();
            writer.write_record([
                record.path.as_str(),
                record.kind.as_str(),
                size.as_str(),
                record.mode.as_str(),
                uid.as_str(),
                gid.as_str(),
                record.mtime_utc.as_str(),
                record.sha256.as_deref().unwrap_or(""),
                record.link_target.as_deref().unwrap_or(""),
                if record.is_executable { "1" } else { "0" },
                record.ext.as_str(),
            ])?;
        }
        writer.flush()?;
    }

    // Pinned gzip header keeps the compressed bytes reproducible.
    let mut encoder = GzBuilder::new()
        .mtime(0)
        .operating_system(255)
        .write(Vec::new(), Compression::default());
    std::io::Write::write_all(&mut encoder, &csv_bytes)?;
    let compressed = encoder.finish()?;

    let digest = sha256_bytes(&compressed);
    Ok((compressed, digest))
}

/// Decode a compressed listing document back into validated records.
pub fn decode_filelist(compressed: &[u8]) -> Result<Vec<FileRecord>> {
    let mut csv_bytes = Vec::new();
    GzDecoder::new(compressed).read_to_end(&mut csv_bytes)?;

    let mut reader = csv::Reader::from_reader(csv_bytes.as_slice());
    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        records.push(record_from_row(&row)?);
    }
    Ok(records)
}

/// Write the listing beside an archive (or anywhere else) and return its
/// digest.
pub fn write_filelist(path: &Path, records: &[FileRecord]) -> Result<String> {
    let (bytes, digest) = encode_filelist(records)?;
    fs::write(path, bytes).map_err(|e| ArchiveError::io(e, path))?;
    Ok(digest)
}

/// Read a listing document from disk.
pub fn read_filelist(path: &Path) -> Result<Vec<FileRecord>> {
    let bytes = fs::read(path).map_err(|e| ArchiveError::io(e, path))?;
    decode_filelist(&bytes)
}

fn field<'a>(row: &'a csv::StringRecord, idx: usize) -> Result<&'a str> {
    row.get(idx).ok_or_else(|| ArchiveError::InvalidField {
        field: "filelist row",
        reason: format!("missing column {} ({})", idx, FILELIST_COLUMNS[idx]),
    })
}

fn record_from_row(row: &csv::StringRecord) -> Result<FileRecord> {
    let size_raw = field(row, 2)?;
    let size = if size_raw.is_empty() {
        None
    } else {
        Some(size_raw.parse::<u64>().map_err(|e| ArchiveError::InvalidField {
            field: "size_bytes",
            reason: format!("'{size_raw}': {e}"),
        })?)
    };
    let uid = parse_id(field(row, 4)?, "uid")?;
    let gid = parse_id(field(row, 5)?, "gid")?;
    let sha256 = match field(row, 7)? {
        "" => None,
        s => Some(s.to_string()),
    };
    let link_target = match field(row, 8)? {
        "" => None,
        s => Some(s.to_string()),
    };

    let record = FileRecord {
        path: field(row, 0)?.to_string(),
        kind: EntryKind::parse(field(row, 1)?)?,
        size,
        mode: field(row, 3)?.to_string(),
        mtime_utc: field(row, 6)?.to_string(),
        sha256,
        link_target,
        uid,
        gid,
        is_executable: field(row, 9)? == "1",
        ext: field(row, 10)?.to_string(),
    };
    // Re-validate on the way in; the derived columns are recomputed.
    record.validated()
}

fn parse_id(raw: &str, name: &'static str) -> Result<u32> {
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse::<u32>().map_err(|e| ArchiveError::InvalidField {
        field: name,
        reason: format!("'{raw}': {e}"),
    })
}
