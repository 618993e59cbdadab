//! Main entry point for the permafrost CLI app

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use permafrost::cli::{self, Commands};
use permafrost::fmtutil::{format_duration, format_size, parse_size};
use permafrost::manifest::EventMetadata;
use permafrost::scanner::FileScanner;
use permafrost::splitter;
use permafrost::transfer::upload_files;
use permafrost::verifier::{ArchiveVerifier, DeepOptions, VerificationResult};
use permafrost::ArchiveBuilder;

/// Exit code for a user interrupt, per the usual shell convention.
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
    init_tracing();
    match run_app() {
        Ok(code) => code,
        Err(e) => {
            if e.downcast_ref::<clap::Error>().is_none() {
                eprintln!("Error: {e}");
            }
            if interrupted(e.as_ref()) {
                ExitCode::from(EXIT_INTERRUPTED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run_app() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let command = cli::run()?;

    match command {
        Commands::Freeze {
            source,
            destination,
            milestone,
            note,
            contact,
            compression_level,
            name,
            exclude,
            respect_gitignore,
            split_size,
            no_manifest,
            no_filelist,
            no_sha256,
        } => run_freeze(FreezeArgs {
            source,
            destination,
            milestone,
            note,
            contact,
            compression_level,
            name,
            exclude,
            respect_gitignore,
            split_size,
            no_manifest,
            no_filelist,
            no_sha256,
        }),
        Commands::Verify {
            archive,
            deep,
            manifest,
            json_output,
            quiet,
            fail_fast,
        } => run_verify(&archive, deep, manifest, json_output, quiet, fail_fast),
        Commands::Inspect {
            archive,
            json_output,
            top,
        } => run_inspect(&archive, json_output, top),
        Commands::Upload {
            files,
            destination,
            provider,
        } => run_upload(&files, &destination, &provider),
    }
}

struct FreezeArgs {
    source: PathBuf,
    destination: PathBuf,
    milestone: Option<String>,
    note: Vec<String>,
    contact: Vec<String>,
    compression_level: u32,
    name: Option<String>,
    exclude: Vec<String>,
    respect_gitignore: bool,
    split_size: Option<String>,
    no_manifest: bool,
    no_filelist: bool,
    no_sha256: bool,
}

fn run_freeze(args: FreezeArgs) -> Result<ExitCode, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&args.destination)?;

    let archive_filename = cli::generate_archive_filename(args.name.as_deref());
    let archive_path = args.destination.join(&archive_filename);
    if archive_path.exists() {
        return Err(format!(
            "archive already exists: {} (use a different --name or remove it)",
            archive_path.display()
        )
        .into());
    }

    let scanner = FileScanner::new(&args.source, &args.exclude, true, args.respect_gitignore)?;

    println!("Scanning source directory...");
    let counts = scanner.count_entries()?;
    let total_size = scanner.estimate_size()?;
    println!(
        "  {} files, {} directories, {} symlinks ({})",
        counts.files,
        counts.dirs,
        counts.symlinks,
        format_size(total_size)
    );

    if let Some(split_size) = &args.split_size {
        return run_freeze_split(&scanner, &archive_path, args.compression_level, split_size);
    }

    let event = EventMetadata {
        event_type: args.milestone.as_ref().map(|_| "milestone".to_string()),
        name: args.milestone.clone(),
        notes: args.note.clone(),
        contacts: args.contact.clone(),
    };

    let builder = ArchiveBuilder::new(&archive_path, args.compression_level)?
        .compute_sha256(!args.no_sha256)
        .generate_filelist(!args.no_filelist)
        .generate_manifest(!args.no_manifest)
        .event_metadata(event);

    println!("Creating archive: {}", archive_path.display());
    let mut progress = |done: u64, total: u64| {
        if total > 0 && (done % 10 == 0 || done == total) {
            print!("\r  {done}/{total} entries");
            let _ = std::io::stdout().flush();
        }
    };
    let result = builder.create_archive(&scanner, None, Some(&mut progress))?;
    println!();

    println!();
    println!("Archive created successfully");
    println!("  Archive:  {}", result.path.display());
    println!("  Size:     {}", format_size(result.size_bytes));
    println!(
        "  Members:  {} files, {} dirs, {} symlinks",
        result.files_added, result.dirs_added, result.symlinks_added
    );
    if let Some(sha256) = &result.sha256 {
        println!("  SHA256:   {sha256}");
    }
    if let Some(path) = &result.manifest_json_path {
        println!("  Manifest: {}", path.display());
    }
    if let Some(path) = &result.sha256_file_path {
        println!("  Checksum: {}", path.display());
    }

    Ok(ExitCode::SUCCESS)
}

fn run_freeze_split(
    scanner: &FileScanner,
    archive_path: &Path,
    compression_level: u32,
    split_size: &str,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let max_part_bytes = parse_size(split_size)?;
    println!(
        "Creating split archives (max part size: {})",
        format_size(max_part_bytes)
    );

    let parts =
        splitter::create_split_archives(scanner, archive_path, compression_level, max_part_bytes, None)?;
    let hashes = splitter::checksum_parts(&parts)?;
    let sha256_path = permafrost::manifest::sidecar_sha256_path(archive_path);
    let master = splitter::write_parts_sha256(&sha256_path, &hashes)?;

    println!();
    println!("Created {} part(s)", parts.len());
    for part in &parts {
        let size = std::fs::metadata(part).map(|m| m.len()).unwrap_or(0);
        println!("  {} ({})", part.display(), format_size(size));
    }
    println!("  Checksums: {}", sha256_path.display());
    println!("  Master SHA256: {master}");

    Ok(ExitCode::SUCCESS)
}

fn run_verify(
    archive: &Path,
    deep: bool,
    manifest: Option<PathBuf>,
    json_output: bool,
    quiet: bool,
    fail_fast: bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let verifier = ArchiveVerifier::new(archive, manifest)?;

    if !quiet && !json_output {
        println!(
            "Verifying {} ({})",
            archive.display(),
            if deep { "deep" } else { "quick" }
        );
    }

    let result = if deep {
        let show_progress = !quiet && !json_output;
        let started = Instant::now();
        let mut last_update = Instant::now();
        let mut progress = move |done: u64, total: u64, current: &str| {
            if !show_progress || last_update.elapsed().as_millis() < 100 {
                return;
            }
            last_update = Instant::now();
            let percent = if total > 0 {
                done as f64 / total as f64 * 100.0
            } else {
                100.0
            };
            print!(
                "\r  {done}/{total} files ({percent:.1}%) | {} | {current:<40}",
                format_duration(started.elapsed().as_secs_f64())
            );
            let _ = std::io::stdout().flush();
        };
        let result = verifier.verify_deep(DeepOptions {
            fail_fast,
            progress: Some(&mut progress),
            cancel: None,
        });
        if show_progress {
            println!();
        }
        result
    } else {
        verifier.verify_quick()
    };

    if json_output {
        println!("{}", result.to_json()?);
    } else if !quiet {
        display_verification_result(&result, archive);
    } else if !result.passed {
        for error in &result.errors {
            eprintln!("{error}");
        }
    }

    Ok(if result.passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn display_verification_result(result: &VerificationResult, archive: &Path) {
    println!();
    if result.passed {
        println!("Verification successful");
    } else {
        println!("Verification FAILED");
    }
    println!("  Archive:  {}", archive.display());
    println!(
        "  Checks:   {}/{} passed",
        result.checks_passed, result.checks_performed
    );
    if let Some(files) = result.files_verified {
        println!("  Files:    {files} verified");
    }
    if let Some(bytes) = result.bytes_verified {
        println!("  Data:     {}", format_size(bytes));
        if let Some(throughput) = result.throughput_mbps() {
            println!("  Speed:    {throughput:.1} MB/s");
        }
    }
    println!("  Duration: {}", format_duration(result.elapsed_seconds));

    if !result.errors.is_empty() {
        println!();
        println!("Errors:");
        for error in &result.errors {
            println!("  - {error}");
        }
    }
    if !result.warnings.is_empty() {
        println!();
        println!("Warnings:");
        for warning in &result.warnings {
            println!("  - {warning}");
        }
    }
    if !result.passed {
        println!();
        println!("Archive failed integrity check. Do not trust this archive.");
    }
}

fn run_inspect(
    archive: &Path,
    json_output: bool,
    top: usize,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let inspector = permafrost::inspector::ArchiveInspector::new(archive, None)?;
    let summary = inspector.summary();

    if json_output {
        let payload = serde_json::json!({
            "summary": summary,
            "largest_files": inspector.largest_files(top),
            "extensions": inspector.extension_stats(),
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Archive:  {}", summary.filename);
    println!("Size:     {}", format_size(summary.size_bytes));
    if let Some(id) = &summary.id {
        println!("Id:       {id}");
    }
    if let Some(created) = &summary.created_utc {
        println!("Created:  {created}");
    }
    if let Some(event) = &summary.event_name {
        println!("Event:    {event}");
    }
    if let Some(counts) = &summary.member_count {
        println!(
            "Members:  {} files, {} dirs, {} symlinks",
            counts.files, counts.dirs, counts.symlinks
        );
    }
    if !summary.manifest_present {
        println!("No manifest available for this archive.");
    }

    let largest = inspector.largest_files(top);
    if !largest.is_empty() {
        println!();
        println!("Largest files:");
        for record in &largest {
            println!(
                "  {:>10}  {}",
                format_size(record.size.unwrap_or(0)),
                record.path
            );
        }
    }

    let extensions = inspector.extension_stats();
    if !extensions.is_empty() {
        println!();
        println!("By extension:");
        for (ext, stat) in &extensions {
            let label = if ext.is_empty() { "(none)" } else { ext };
            println!(
                "  {label:<12} {:>6} files  {}",
                stat.count,
                format_size(stat.total_bytes)
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn run_upload(
    files: &[PathBuf],
    destination: &str,
    provider: &str,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let results = upload_files(files, destination, provider);
    let succeeded = results.values().filter(|r| r.success).count();
    println!(
        "Upload complete: {succeeded}/{} files uploaded successfully",
        results.len()
    );
    for (path, outcome) in &results {
        if !outcome.success {
            println!(
                "  failed: {} ({})",
                path.display(),
                outcome.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    // An empty result map means nothing was eligible for upload.
    Ok(if !results.is_empty() && succeeded == results.len() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn interrupted(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                return true;
            }
        }
        current = e.source();
    }
    false
}
