//! Bundle working trees and build options for Kiln.
//!
//! A `Bundle` is the on-disk working tree of one build stage: a rootfs under
//! `fs/`, scratch space under `tmp/`, the parsed recipe, and the `Options`
//! that decide which sections run. `BundleLayout` names every path the
//! pipeline writes, including the image metadata tree.

pub mod bundle;
pub mod layout;
pub mod options;

pub use bundle::{force_remove, Bundle};
pub use layout::{confine, write_atomic, BundleLayout, METADATA_DIR, SCIF_APPS_DIR, SCIF_DATA_DIR};
pub use options::{EncryptionKey, Options};

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to create bundle under {}: {source}", .path.display())]
    CreateFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to remove bundle {}: {source}", .path.display())]
    RemoveFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("path has no parent directory: {}", .0.display())]
    InvalidPath(PathBuf),
    #[error("invalid section selection: {0}")]
    InvalidSections(String),
}
