use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Create an immutable archive of a directory with integrity metadata.
    #[command(alias = "f")]
    Freeze {
        /// Source directory to archive.
        source: PathBuf,

        /// Destination directory for the archive and its sidecars.
        destination: PathBuf,

        /// Event name recorded in the manifest (e.g. "v1.0 release").
        #[arg(long)]
        milestone: Option<String>,

        /// Description note recorded in the manifest (repeatable).
        #[arg(long)]
        note: Vec<String>,

        /// Contact info recorded in the manifest (repeatable).
        #[arg(long)]
        contact: Vec<String>,

        /// Gzip compression level (0=fastest, 9=smallest).
        #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(u32).range(0..=9))]
        compression_level: u32,

        /// Custom archive name (overrides the default timestamp-based name).
        #[arg(long)]
        name: Option<String>,

        /// Exclude pattern (repeatable).
        #[arg(long)]
        exclude: Vec<String>,

        /// Also honor .gitignore globs at the source root (plain globs only).
        #[arg(long)]
        respect_gitignore: bool,

        /// Split into parts of at most this estimated size (e.g. "2GB").
        /// Split parts carry checksums but no embedded metadata.
        #[arg(long)]
        split_size: Option<String>,

        /// Disable sidecar + embedded manifest generation.
        #[arg(long = "no-manifest")]
        no_manifest: bool,

        /// Disable embedded file listing generation.
        #[arg(long = "no-filelist")]
        no_filelist: bool,

        /// Disable archive SHA256 computation.
        #[arg(long = "no-sha256")]
        no_sha256: bool,
    },

    /// Verify archive integrity against its metadata.
    #[command(alias = "v")]
    Verify {
        /// The archive file to verify (.tar.gz).
        archive: PathBuf,

        /// Perform deep verification (re-hash every file's content).
        #[arg(long)]
        deep: bool,

        /// Path to the manifest (default: <archive>.MANIFEST.json).
        #[arg(long)]
        manifest: Option<PathBuf>,

        /// Output the result as JSON.
        #[arg(long = "json")]
        json_output: bool,

        /// Suppress output except errors.
        #[arg(long)]
        quiet: bool,

        /// Stop at the first error.
        #[arg(long)]
        fail_fast: bool,
    },

    /// Inspect an archive's metadata without verifying content.
    #[command(alias = "i")]
    Inspect {
        /// The archive file to inspect.
        archive: PathBuf,

        /// Output as JSON.
        #[arg(long = "json")]
        json_output: bool,

        /// How many of the largest files to list.
        #[arg(long, default_value_t = 10)]
        top: usize,
    },

    /// Upload archive artifacts to remote storage.
    Upload {
        /// Files to upload.
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Destination path/URL understood by the provider.
        #[arg(short, long)]
        destination: String,

        /// Transfer provider to use.
        #[arg(long, default_value = "rclone")]
        provider: String,
    },
}

/// Generate an archive filename: either the custom name (with `.tar.gz`
/// appended if missing) or the default timestamp-based form
/// `permafrost_YYYY-MM-DD_HH-MM-SS_XXXXXX.tar.gz`, where the suffix is six
/// random hex characters for collision resistance.
pub fn generate_archive_filename(custom_name: Option<&str>) -> String {
    if let Some(name) = custom_name {
        if name.ends_with(".tar.gz") {
            return name.to_string();
        }
        return format!("{name}.tar.gz");
    }

    let timestamp = chrono::Utc::now().format("%Y-%m-%d_%H-%M-%S");
    let suffix: [u8; 3] = rand::random();
    format!(
        "permafrost_{timestamp}_{:02x}{:02x}{:02x}.tar.gz",
        suffix[0], suffix[1], suffix[2]
    )
}

/// Parses command-line arguments and returns the command to execute.
pub fn run() -> Result<Commands, Box<dyn std::error::Error>> {
    let args = Args::parse();
    Ok(args.command)
}
