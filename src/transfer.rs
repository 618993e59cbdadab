//! Object transfer to remote storage.
//!
//! Thin wrapper around an external transfer tool (`rclone`). One file's
//! failure never aborts the batch: every input path gets its own outcome in
//! the returned map.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{info, warn};

/// Outcome of transferring a single file.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl TransferOutcome {
    fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Upload files to `destination` with the named provider.
///
/// Missing input paths are skipped. Every attempted file appears in the
/// result map with its own success flag and error text; the batch always
/// runs to completion.
pub fn upload_files(
    files: &[PathBuf],
    destination: &str,
    provider: &str,
) -> BTreeMap<PathBuf, TransferOutcome> {
    let mut results = BTreeMap::new();

    for file in files {
        if !file.exists() {
            warn!("skipping missing file: {}", file.display());
            continue;
        }

        let outcome = match provider {
            "rclone" => upload_with_rclone(file, destination),
            other => TransferOutcome::failed(format!("provider not supported: {other}")),
        };

        if outcome.success {
            info!("uploaded: {}", file.display());
        } else if let Some(err) = &outcome.error {
            warn!("upload failed for {}: {err}", file.display());
        }
        results.insert(file.clone(), outcome);
    }

    results
}

fn upload_with_rclone(file: &Path, destination: &str) -> TransferOutcome {
    let output = Command::new("rclone")
        .arg("copy")
        .arg(file)
        .arg(destination)
        .output();
    match output {
        Ok(output) if output.status.success() => TransferOutcome::ok(),
        Ok(output) => TransferOutcome::failed(String::from_utf8_lossy(&output.stderr).into_owned()),
        Err(e) => TransferOutcome::failed(e.to_string()),
    }
}
