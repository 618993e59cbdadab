//! Git repository snapshot for the manifest.
//!
//! Shells out to the `git` binary. A missing binary, a directory that is not
//! a repository, or any subprocess failure all collapse to
//! `GitMetadata { present: false }`; collection never fails an archive run.

use std::path::Path;
use std::process::Command;

use tracing::debug;

use crate::manifest::GitMetadata;

/// Run one git subcommand against `root`, returning trimmed stdout on
/// success and `None` on any failure.
fn git_output(root: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(args)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Collect the git state of `root`.
pub fn collect_git(root: &Path) -> GitMetadata {
    let inside = git_output(root, &["rev-parse", "--is-inside-work-tree"]);
    if inside.as_deref() != Some("true") {
        debug!("no git repository at {}", root.display());
        return GitMetadata::default();
    }

    // `status --porcelain` prints nothing for a clean tree, so the emptiness
    // of stdout is the signal, not command success.
    let dirty = Command::new("git")
        .arg("-C")
        .arg(root)
        .args(["status", "--porcelain"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| !o.stdout.is_empty());

    GitMetadata {
        present: true,
        commit: git_output(root, &["rev-parse", "HEAD"]),
        branch: git_output(root, &["rev-parse", "--abbrev-ref", "HEAD"]),
        tag: git_output(root, &["describe", "--tags", "--exact-match"]),
        dirty,
        remote_origin_url: git_output(root, &["config", "--get", "remote.origin.url"]),
    }
}
