//! # Permafrost Core Library
//!
//! This crate provides the core functionality for the `permafrost` cold-storage
//! archiver.
//!
//! It is designed to be used by the `permafrost` command-line application, but
//! its public API can also be used to programmatically create, inspect and
//! verify `.tar.gz` archives with machine-checkable integrity metadata.
//!
//! ## Key Modules
//!
//! - [`scanner`]: Deterministic filesystem walking with exclusion rules.
//! - [`archiver`]: Streaming tar+gzip archive construction with simultaneous
//!   digesting.
//! - [`manifest`]: The manifest and per-file record model, validation and
//!   (de)serialization.
//! - [`filelist`]: The compressed tabular file listing and its digest.
//! - [`verifier`]: Quick (structure/hash) and deep (per-file content)
//!   integrity verification.
//! - [`inspector`]: Read-only views over already-produced metadata.
//! - [`splitter`]: Size-bounded split archives.
//!
//! ## Example
//!
//! ```no_run
//! use permafrost::scanner::FileScanner;
//! use permafrost::ArchiveBuilder;
//!
//! # fn main() -> Result<(), permafrost::ArchiveError> {
//! let scanner = FileScanner::new("project".as_ref(), &[], true, false)?;
//! let builder = ArchiveBuilder::new("project.tar.gz".as_ref(), 6)?;
//! let result = builder.create_archive(&scanner, None, None)?;
//! println!("archive digest: {:?}", result.sha256);
//! # Ok(())
//! # }
//! ```

pub mod archiver;
pub mod cli;
pub mod error;
pub mod filelist;
pub mod fmtutil;
pub mod hashing;
pub mod inspector;
pub mod manifest;
pub mod meta;
pub mod scanner;
pub mod splitter;
pub mod transfer;
pub mod verifier;

pub use archiver::{ArchiveBuilder, BuildResult};
pub use error::ArchiveError;
