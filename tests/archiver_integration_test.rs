//! Integration tests for the streaming archive builder.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use permafrost::manifest::ArchiveManifest;
use permafrost::scanner::FileScanner;
use permafrost::ArchiveBuilder;
use tempfile::tempdir;

fn scanner(root: &Path) -> FileScanner {
    FileScanner::new(root, &[], true, false).unwrap()
}

fn archive_member_names(archive: &Path) -> Vec<String> {
    let file = File::open(archive).unwrap();
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    tar.entries()
        .unwrap()
        .map(|e| {
            e.unwrap()
                .path()
                .unwrap()
                .to_string_lossy()
                .trim_end_matches('/')
                .to_string()
        })
        .collect()
}

fn read_member(archive: &Path, member: &str) -> Option<Vec<u8>> {
    let file = File::open(archive).unwrap();
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    for entry in tar.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap() == Path::new(member) {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).unwrap();
            return Some(bytes);
        }
    }
    None
}

#[test]
fn test_basic_archive_with_all_features() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("source");
    fs::create_dir(&source).unwrap();
    fs::write(source.join("file.txt"), "content1").unwrap();

    let archive_path = dir.path().join("test.tar.gz");
    let builder = ArchiveBuilder::new(&archive_path, 6).unwrap();
    let result = builder.create_archive(&scanner(&source), None, None).unwrap();

    assert_eq!(result.files_added, 1);
    assert_eq!(result.dirs_added, 0);
    assert_eq!(result.size_bytes, fs::metadata(&archive_path).unwrap().len());

    let digest = result.sha256.as_deref().unwrap();
    assert_eq!(digest.len(), 64);
    assert!(digest
        .chars()
        .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

    // Sidecar manifest records the real on-disk size.
    let manifest = ArchiveManifest::read_json(&result.manifest_json_path.clone().unwrap()).unwrap();
    assert_eq!(
        manifest.archive.size_bytes,
        Some(fs::metadata(&archive_path).unwrap().len())
    );
    assert_eq!(manifest.archive.sha256.as_deref(), Some(digest));
    assert_eq!(manifest.archive.member_count.files, 1);

    // Checksum sidecar in `<hex>  <filename>` line form.
    let checksum = fs::read_to_string(result.sha256_file_path.unwrap()).unwrap();
    assert_eq!(checksum, format!("{digest}  test.tar.gz\n"));
}

#[test]
fn test_members_and_embedded_metadata() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("source");
    fs::create_dir_all(source.join("sub")).unwrap();
    fs::write(source.join("a.txt"), "a").unwrap();
    fs::write(source.join("sub/b.txt"), "b").unwrap();

    let archive_path = dir.path().join("test.tar.gz");
    let builder = ArchiveBuilder::new(&archive_path, 6).unwrap();
    let result = builder.create_archive(&scanner(&source), None, None).unwrap();

    assert_eq!(result.files_added, 2);
    assert_eq!(result.dirs_added, 1);

    let names = archive_member_names(&archive_path);
    assert!(names.contains(&"source/a.txt".to_string()));
    assert!(names.contains(&"source/sub".to_string()));
    assert!(names.contains(&"source/sub/b.txt".to_string()));
    assert!(names.contains(&"PERMAFROST/FILELIST.csv.gz".to_string()));
    assert!(names.contains(&"PERMAFROST/MANIFEST.json".to_string()));

    // The embedded rendering nulls the two self-referential fields but is
    // otherwise identical to the sidecar.
    let embedded_bytes = read_member(&archive_path, "PERMAFROST/MANIFEST.json").unwrap();
    let embedded = ArchiveManifest::from_json(&String::from_utf8(embedded_bytes).unwrap()).unwrap();
    assert_eq!(embedded.archive.size_bytes, None);
    assert_eq!(embedded.archive.sha256, None);

    let sidecar = ArchiveManifest::read_json(&result.manifest_json_path.unwrap()).unwrap();
    assert_eq!(embedded, sidecar.embedded());

    // The embedded file listing digest matches what the manifest records.
    let filelist_bytes = read_member(&archive_path, "PERMAFROST/FILELIST.csv.gz").unwrap();
    let expected = sidecar.verification.per_file_hash.filelist_sha256.unwrap();
    assert_eq!(permafrost::hashing::sha256_bytes(&filelist_bytes), expected);
    assert_eq!(result.filelist_sha256.unwrap(), expected);
}

#[test]
fn test_custom_arcname_root() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("source");
    fs::create_dir(&source).unwrap();
    fs::write(source.join("file.txt"), "content").unwrap();

    let archive_path = dir.path().join("test.tar.gz");
    let builder = ArchiveBuilder::new(&archive_path, 6).unwrap();
    builder
        .create_archive(&scanner(&source), Some("custom_name"), None)
        .unwrap();

    let names = archive_member_names(&archive_path);
    assert!(names.contains(&"custom_name/file.txt".to_string()));
    assert!(!names.contains(&"source/file.txt".to_string()));
}

#[test]
fn test_sha256_matches_independent_computation() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("source");
    fs::create_dir(&source).unwrap();
    fs::write(source.join("file.txt"), "test content").unwrap();

    let archive_path = dir.path().join("test.tar.gz");
    let builder = ArchiveBuilder::new(&archive_path, 6).unwrap();
    let result = builder.create_archive(&scanner(&source), None, None).unwrap();

    let independent = permafrost::hashing::sha256_file(&archive_path).unwrap();
    assert_eq!(result.sha256.unwrap(), independent);
}

#[test]
fn test_toggles_disable_outputs() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("source");
    fs::create_dir(&source).unwrap();
    fs::write(source.join("file.txt"), "content").unwrap();

    let archive_path = dir.path().join("test.tar.gz");
    let builder = ArchiveBuilder::new(&archive_path, 6)
        .unwrap()
        .compute_sha256(false)
        .generate_filelist(false)
        .generate_manifest(false);
    let result = builder.create_archive(&scanner(&source), None, None).unwrap();

    assert_eq!(result.sha256, None);
    assert_eq!(result.filelist_sha256, None);
    assert_eq!(result.manifest_json_path, None);
    assert_eq!(result.sha256_file_path, None);

    let names = archive_member_names(&archive_path);
    assert!(names.iter().all(|n| !n.starts_with("PERMAFROST")));
    assert!(!archive_path
        .with_file_name("test.tar.gz.MANIFEST.json")
        .exists());
    assert!(!archive_path.with_file_name("test.tar.gz.sha256").exists());
}

#[test]
fn test_excluded_files_not_in_archive() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("source");
    fs::create_dir(&source).unwrap();
    fs::write(source.join("keep.py"), "keep").unwrap();
    fs::write(source.join("skip.pyc"), "skip").unwrap();

    let archive_path = dir.path().join("test.tar.gz");
    let s = FileScanner::new(&source, &["*.pyc".to_string()], true, false).unwrap();
    let builder = ArchiveBuilder::new(&archive_path, 6).unwrap();
    let result = builder.create_archive(&s, None, None).unwrap();

    assert_eq!(result.files_added, 1);
    let names = archive_member_names(&archive_path);
    assert!(names.contains(&"source/keep.py".to_string()));
    assert!(!names.contains(&"source/skip.pyc".to_string()));
}

#[cfg(unix)]
#[test]
fn test_symlinks_stored_as_links() {
    use std::os::unix::fs::symlink;

    let dir = tempdir().unwrap();
    let source = dir.path().join("source");
    fs::create_dir(&source).unwrap();
    fs::write(source.join("target.txt"), "target").unwrap();
    symlink("target.txt", source.join("link.txt")).unwrap();

    let archive_path = dir.path().join("test.tar.gz");
    let builder = ArchiveBuilder::new(&archive_path, 6).unwrap();
    let result = builder.create_archive(&scanner(&source), None, None).unwrap();

    assert_eq!(result.files_added, 1);
    assert_eq!(result.symlinks_added, 1);

    let file = File::open(&archive_path).unwrap();
    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut found = false;
    for entry in tar.entries().unwrap() {
        let entry = entry.unwrap();
        if entry.path().unwrap() == Path::new("source/link.txt") {
            assert_eq!(entry.header().entry_type(), tar::EntryType::Symlink);
            assert_eq!(
                entry.link_name().unwrap().unwrap(),
                Path::new("target.txt")
            );
            found = true;
        }
    }
    assert!(found);
}

#[test]
fn test_empty_directory_archives_cleanly() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("source");
    fs::create_dir(&source).unwrap();

    let archive_path = dir.path().join("empty.tar.gz");
    let builder = ArchiveBuilder::new(&archive_path, 6).unwrap();
    let result = builder.create_archive(&scanner(&source), None, None).unwrap();

    assert_eq!(result.files_added, 0);
    assert_eq!(result.dirs_added, 0);
    assert!(archive_path.exists());
}

#[test]
fn test_unicode_filenames() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("source");
    fs::create_dir(&source).unwrap();
    fs::write(source.join("emoji_🎉.txt"), "content").unwrap();
    fs::write(source.join("中文.py"), "code").unwrap();

    let archive_path = dir.path().join("test.tar.gz");
    let builder = ArchiveBuilder::new(&archive_path, 6).unwrap();
    let result = builder.create_archive(&scanner(&source), None, None).unwrap();

    assert_eq!(result.files_added, 2);
    let names = archive_member_names(&archive_path);
    assert!(names.contains(&"source/emoji_🎉.txt".to_string()));
    assert!(names.contains(&"source/中文.py".to_string()));
}

#[test]
fn test_partial_output_deleted_on_failure() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("source");
    fs::create_dir(&source).unwrap();
    fs::write(source.join("file.txt"), "content").unwrap();

    // Output directory does not exist, so the very first write fails.
    let archive_path = dir.path().join("missing_dir").join("test.tar.gz");
    let builder = ArchiveBuilder::new(&archive_path, 6).unwrap();
    let err = builder.create_archive(&scanner(&source), None, None);

    assert!(err.is_err());
    assert!(!archive_path.exists());
}

#[test]
fn test_large_file_streams_through() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("source");
    fs::create_dir(&source).unwrap();
    // 10 MiB, larger than any internal chunk.
    fs::write(source.join("large.bin"), vec![b'X'; 10 * 1024 * 1024]).unwrap();

    let archive_path = dir.path().join("test.tar.gz");
    let builder = ArchiveBuilder::new(&archive_path, 1).unwrap();
    let result = builder.create_archive(&scanner(&source), None, None).unwrap();

    assert_eq!(result.files_added, 1);
    let bytes = read_member(&archive_path, "source/large.bin").unwrap();
    assert_eq!(bytes.len(), 10 * 1024 * 1024);
}

#[test]
fn test_progress_callback_reports_every_entry() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("source");
    fs::create_dir(&source).unwrap();
    for i in 0..5 {
        fs::write(source.join(format!("f{i}.txt")), "x").unwrap();
    }

    let archive_path = dir.path().join("test.tar.gz");
    let builder = ArchiveBuilder::new(&archive_path, 6).unwrap();
    let mut seen = Vec::new();
    let mut progress = |done: u64, total: u64| seen.push((done, total));
    builder
        .create_archive(&scanner(&source), None, Some(&mut progress))
        .unwrap();

    assert_eq!(seen.len(), 5);
    assert_eq!(seen.first(), Some(&(1, 5)));
    assert_eq!(seen.last(), Some(&(5, 5)));
}
