use crate::copy::copy_tree;
use crate::RuntimeError;
use kiln_bundle::{force_remove, Bundle};
use std::fs::{self, File};
use std::path::Path;
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Output format of the final image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Sandbox,
    Tar,
    Squashfs,
}

impl ImageFormat {
    pub fn from_name(name: &str) -> Result<Self, RuntimeError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "sandbox" | "dir" => Ok(Self::Sandbox),
            "tar" => Ok(Self::Tar),
            "squashfs" | "sqfs" => Ok(Self::Squashfs),
            other => Err(RuntimeError::UnsupportedFormat(format!(
                "unknown image format '{other}' (expected sandbox, tar, or squashfs)"
            ))),
        }
    }

    /// Format implied by a destination path: `.tar` means tar, anything else
    /// squashfs.
    pub fn for_destination(dest: &Path) -> Self {
        match dest.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("tar") => Self::Tar,
            _ => Self::Squashfs,
        }
    }
}

/// Turns a finished bundle into an image at a destination path.
pub trait Assembler {
    fn name(&self) -> &'static str;

    fn supports_encryption(&self) -> bool {
        false
    }

    fn assemble(&self, bundle: &Bundle, dest: &Path) -> Result<(), RuntimeError>;
}

pub fn select_assembler(format: ImageFormat, force: bool) -> Box<dyn Assembler> {
    match format {
        ImageFormat::Sandbox => Box::new(SandboxAssembler { force }),
        ImageFormat::Tar => Box::new(TarAssembler { force }),
        ImageFormat::Squashfs => Box::new(SquashfsAssembler { force }),
    }
}

fn prepare_destination(dest: &Path, force: bool) -> Result<(), RuntimeError> {
    if fs::symlink_metadata(dest).is_ok() {
        if !force {
            return Err(RuntimeError::DestinationExists(dest.to_path_buf()));
        }
        debug!("replacing existing {}", dest.display());
        if dest.is_dir() {
            force_remove(dest)?;
        } else {
            fs::remove_file(dest)?;
        }
    }
    if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Writes the rootfs as a directory tree.
pub struct SandboxAssembler {
    force: bool,
}

impl Assembler for SandboxAssembler {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn assemble(&self, bundle: &Bundle, dest: &Path) -> Result<(), RuntimeError> {
        prepare_destination(dest, self.force)?;
        info!("creating sandbox directory {}", dest.display());
        let rootfs = bundle.rootfs();
        if fs::rename(&rootfs, dest).is_err() {
            // Different filesystem.
            copy_tree(&rootfs, dest)?;
        }
        Ok(())
    }
}

/// Writes the rootfs as an uncompressed tar archive.
pub struct TarAssembler {
    force: bool,
}

impl Assembler for TarAssembler {
    fn name(&self) -> &'static str {
        "tar"
    }

    fn assemble(&self, bundle: &Bundle, dest: &Path) -> Result<(), RuntimeError> {
        prepare_destination(dest, self.force)?;
        info!("creating tar image {}", dest.display());
        let dir = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir)?;
        {
            let mut builder = tar::Builder::new(tmp.as_file());
            builder.follow_symlinks(false);
            builder.append_dir_all(".", bundle.rootfs())?;
            builder.finish()?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(dest).map_err(|e| RuntimeError::Io(e.error))?;
        Ok(())
    }
}

/// Writes the rootfs as a squashfs filesystem with `mksquashfs`.
pub struct SquashfsAssembler {
    force: bool,
}

impl Assembler for SquashfsAssembler {
    fn name(&self) -> &'static str {
        "squashfs"
    }

    fn assemble(&self, bundle: &Bundle, dest: &Path) -> Result<(), RuntimeError> {
        prepare_destination(dest, self.force)?;
        info!("creating squashfs image {}", dest.display());
        let output = Command::new("mksquashfs")
            .arg(bundle.rootfs())
            .arg(dest)
            .arg("-noappend")
            .output()
            .map_err(|e| RuntimeError::ExecFailed(format!("mksquashfs not found or failed to start: {e}")))?;
        if !output.status.success() {
            let _ = fs::remove_file(dest);
            return Err(RuntimeError::ExecFailed(format!(
                "mksquashfs failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        // Confirm something usable was written.
        File::open(dest)?;
        Ok(())
    }
}
