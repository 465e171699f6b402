//! Bootstrap sources, script sandbox, and assemblers for Kiln builds.
//!
//! This crate implements the execution layer of a build: the `ConveyorPacker`
//! registry that turns a `bootstrap` header into a populated rootfs, the
//! local-image format probe, the privileged script sandbox that runs
//! `%setup`/`%post`/`%test` with a fixed environment and read-only session
//! files, mount-flag checks, the download cache, and the `Assembler`
//! variants that write the finished image.

pub mod assemble;
pub mod bootstrap;
pub mod conveyor;
pub mod copy;
pub mod download;
pub mod localimage;
pub mod mounts;
pub mod oci;
pub mod prereq;
pub mod sandbox;
pub mod scratch;

pub use assemble::{select_assembler, Assembler, ImageFormat};
pub use conveyor::{
    pack_base, registered_bootstraps, select_conveyor_packer, ConveyorPacker,
};
pub use copy::{copy_path, copy_tree};
pub use localimage::unmount;
pub use mounts::{check_exec_allowed, MountFlags};
pub use prereq::{check_assembler_prereqs, check_build_prereqs, format_missing, MissingPrereq};
pub use sandbox::{run_host_script, ExecMode, ScriptSandbox};

use kiln_bundle::BundleError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Bundle(#[from] BundleError),
    #[error("unknown bootstrap '{0}'")]
    UnknownBootstrap(String),
    #[error("bootstrap '{bootstrap}' requires the '{key}' header")]
    MissingHeader { bootstrap: String, key: String },
    #[error("bootstrap '{0}' requires an image cache, but caching is disabled")]
    CacheRequired(String),
    #[error("{} is mounted noexec; scripts cannot run from it", .0.display())]
    NoExecMount(PathBuf),
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),
    #[error("unsupported image source: {0}")]
    UnsupportedSource(String),
    #[error("download of {url} failed: {reason}")]
    Download { url: String, reason: String },
    #[error("%{section} script failed with exit code {}", .code.map_or_else(|| "signal".to_owned(), |c| c.to_string()))]
    ScriptFailed { section: String, code: Option<i32> },
    #[error("assembler '{0}' does not support encrypted images")]
    EncryptionUnsupported(String),
    #[error("destination {} already exists (use --force to overwrite)", .0.display())]
    DestinationExists(PathBuf),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_failed_reports_code_or_signal() {
        let e = RuntimeError::ScriptFailed {
            section: "post".to_owned(),
            code: Some(3),
        };
        assert_eq!(e.to_string(), "%post script failed with exit code 3");
        let e = RuntimeError::ScriptFailed {
            section: "test".to_owned(),
            code: None,
        };
        assert!(e.to_string().ends_with("signal"));
    }

    #[test]
    fn missing_header_names_key() {
        let e = RuntimeError::MissingHeader {
            bootstrap: "localimage".to_owned(),
            key: "from".to_owned(),
        };
        assert!(e.to_string().contains("'from'"));
    }
}
