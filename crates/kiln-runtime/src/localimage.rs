use crate::conveyor::ConveyorPacker;
use crate::copy::copy_tree;
use crate::RuntimeError;
use kiln_bundle::Bundle;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// On-disk container of a local base image, decided by content, not name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalFormat {
    Sandbox,
    Tar,
    Squashfs,
    Ext3,
    Sif,
}

impl LocalFormat {
    pub fn name(self) -> &'static str {
        match self {
            Self::Sandbox => "sandbox",
            Self::Tar => "tar",
            Self::Squashfs => "squashfs",
            Self::Ext3 => "ext3",
            Self::Sif => "sif",
        }
    }
}

const PROBE_LEN: u64 = 4096;

/// Identify an image by its leading bytes.
pub fn probe_format(path: &Path) -> Result<LocalFormat, RuntimeError> {
    let meta = fs::metadata(path)?;
    if meta.is_dir() {
        return Ok(LocalFormat::Sandbox);
    }

    let mut head = Vec::with_capacity(PROBE_LEN as usize);
    File::open(path)?.take(PROBE_LEN).read_to_end(&mut head)?;

    if head.get(32..41) == Some(b"SIF_MAGIC".as_slice()) {
        return Ok(LocalFormat::Sif);
    }
    if head.starts_with(b"hsqs") {
        return Ok(LocalFormat::Squashfs);
    }
    if head.get(1080..1082) == Some([0x53, 0xEF].as_slice()) {
        return Ok(LocalFormat::Ext3);
    }
    if head.get(257..262) == Some(b"ustar".as_slice()) {
        return Ok(LocalFormat::Tar);
    }
    Err(RuntimeError::UnsupportedFormat(format!(
        "cannot identify image format of {}",
        path.display()
    )))
}

/// `bootstrap: localimage`: seed the rootfs from an image or sandbox on disk.
#[derive(Debug, Default)]
pub struct LocalImageConveyorPacker {
    mount_point: Option<PathBuf>,
}

impl LocalImageConveyorPacker {
    /// Unpack `image` into the bundle rootfs according to its probed format.
    pub fn extract(&mut self, image: &Path, bundle: &Bundle) -> Result<(), RuntimeError> {
        let format = probe_format(image)?;
        let rootfs = bundle.rootfs();
        info!(
            "unpacking {} image {} into {}",
            format.name(),
            image.display(),
            rootfs.display()
        );
        match format {
            LocalFormat::Sandbox => copy_tree(image, &rootfs),
            LocalFormat::Tar => unpack_tar(image, &rootfs),
            LocalFormat::Squashfs => unpack_squashfs(image, &rootfs),
            LocalFormat::Ext3 => {
                let mnt = tempfile::Builder::new()
                    .prefix("ext3-")
                    .tempdir_in(bundle.tmp_dir())?
                    .keep();
                mount_loop(image, &mnt)?;
                self.mount_point = Some(mnt.clone());
                copy_tree(&mnt, &rootfs)
            }
            LocalFormat::Sif => Err(RuntimeError::UnsupportedFormat(format!(
                "{} is a SIF image; convert it to a sandbox or squashfs first",
                image.display()
            ))),
        }
    }
}

impl ConveyorPacker for LocalImageConveyorPacker {
    fn name(&self) -> &'static str {
        "localimage"
    }

    fn get(&mut self, bundle: &mut Bundle) -> Result<(), RuntimeError> {
        let from = bundle
            .recipe
            .header
            .get("from")
            .filter(|f| !f.trim().is_empty())
            .ok_or_else(|| RuntimeError::MissingHeader {
                bootstrap: "localimage".to_owned(),
                key: "from".to_owned(),
            })?;
        let image = PathBuf::from(from.trim());
        self.extract(&image, bundle)
    }

    fn mount_points(&self) -> Vec<PathBuf> {
        self.mount_point.iter().cloned().collect()
    }

    fn clean_up(&mut self) -> Result<(), RuntimeError> {
        match self.mount_point.take() {
            Some(mnt) => unmount(&mnt),
            None => Ok(()),
        }
    }
}

/// Unmount `mnt` and remove the now-empty mount point.
pub fn unmount(mnt: &Path) -> Result<(), RuntimeError> {
    debug!("unmounting {}", mnt.display());
    let status = Command::new("umount").arg(mnt).status()?;
    if !status.success() {
        warn!("failed to unmount {}", mnt.display());
        return Err(RuntimeError::ExecFailed(format!(
            "umount {} failed",
            mnt.display()
        )));
    }
    fs::remove_dir(mnt)?;
    Ok(())
}

fn unpack_tar(image: &Path, rootfs: &Path) -> Result<(), RuntimeError> {
    let mut archive = tar::Archive::new(File::open(image)?);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.set_unpack_xattrs(false);
    archive.unpack(rootfs)?;
    Ok(())
}

fn unpack_squashfs(image: &Path, rootfs: &Path) -> Result<(), RuntimeError> {
    let output = Command::new("unsquashfs")
        .arg("-f")
        .arg("-d")
        .arg(rootfs)
        .arg(image)
        .output()
        .map_err(|e| RuntimeError::ExecFailed(format!("unsquashfs not found or failed to start: {e}")))?;
    if !output.status.success() {
        return Err(RuntimeError::ExecFailed(format!(
            "unsquashfs {} failed: {}",
            image.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

fn mount_loop(image: &Path, mnt: &Path) -> Result<(), RuntimeError> {
    let output = Command::new("mount")
        .args(["-o", "loop,ro"])
        .arg(image)
        .arg(mnt)
        .output()
        .map_err(|e| RuntimeError::ExecFailed(format!("mount failed to start: {e}")))?;
    if !output.status.success() {
        return Err(RuntimeError::ExecFailed(format!(
            "loop mount of {} failed: {}",
            image.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}
