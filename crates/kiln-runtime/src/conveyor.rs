use crate::RuntimeError;
use kiln_bundle::{write_atomic, Bundle};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// A bootstrap source: fetches rootfs content and prepares the bundle.
///
/// `get` brings content into the bundle rootfs, `pack` lays down the
/// metadata skeleton, and `clean_up` releases whatever `get` acquired
/// (mounts, scratch files). The orchestrator calls `clean_up` whether or not
/// the other phases succeeded.
pub trait ConveyorPacker: Send {
    fn name(&self) -> &'static str;

    /// Whether this source downloads into the image cache.
    fn requires_cache(&self) -> bool {
        false
    }

    fn get(&mut self, bundle: &mut Bundle) -> Result<(), RuntimeError>;

    fn pack(&mut self, bundle: &mut Bundle) -> Result<(), RuntimeError> {
        pack_base(bundle)
    }

    /// Mounts acquired by `get` that are still held. An interrupted build
    /// releases these before deleting the bundle.
    fn mount_points(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn clean_up(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

type Constructor = fn() -> Box<dyn ConveyorPacker>;

const REGISTRY: &[(&str, Constructor)] = &[
    ("scratch", scratch),
    ("localimage", localimage),
    ("docker", docker),
    ("docker-archive", docker_archive),
    ("docker-daemon", docker_daemon),
    ("oci", oci),
    ("oci-archive", oci_archive),
    ("library", library),
    ("shub", shub),
    ("debootstrap", debootstrap),
    ("yum", yum),
    ("zypper", zypper),
    ("arch", arch),
    ("busybox", busybox),
];

fn scratch() -> Box<dyn ConveyorPacker> {
    Box::<crate::scratch::ScratchConveyorPacker>::default()
}

fn localimage() -> Box<dyn ConveyorPacker> {
    Box::<crate::localimage::LocalImageConveyorPacker>::default()
}

fn docker() -> Box<dyn ConveyorPacker> {
    Box::new(crate::oci::OciConveyorPacker::new(crate::oci::Transport::Docker))
}

fn docker_archive() -> Box<dyn ConveyorPacker> {
    Box::new(crate::oci::OciConveyorPacker::new(crate::oci::Transport::DockerArchive))
}

fn docker_daemon() -> Box<dyn ConveyorPacker> {
    Box::new(crate::oci::OciConveyorPacker::new(crate::oci::Transport::DockerDaemon))
}

fn oci() -> Box<dyn ConveyorPacker> {
    Box::new(crate::oci::OciConveyorPacker::new(crate::oci::Transport::OciLayout))
}

fn oci_archive() -> Box<dyn ConveyorPacker> {
    Box::new(crate::oci::OciConveyorPacker::new(crate::oci::Transport::OciArchive))
}

fn library() -> Box<dyn ConveyorPacker> {
    Box::new(crate::download::DownloadConveyorPacker::new("library"))
}

fn shub() -> Box<dyn ConveyorPacker> {
    Box::new(crate::download::DownloadConveyorPacker::new("shub"))
}

fn debootstrap() -> Box<dyn ConveyorPacker> {
    Box::new(crate::bootstrap::OsBootstrapConveyorPacker::new(
        crate::bootstrap::BootstrapTool::Debootstrap,
    ))
}

fn yum() -> Box<dyn ConveyorPacker> {
    Box::new(crate::bootstrap::OsBootstrapConveyorPacker::new(
        crate::bootstrap::BootstrapTool::Yum,
    ))
}

fn zypper() -> Box<dyn ConveyorPacker> {
    Box::new(crate::bootstrap::OsBootstrapConveyorPacker::new(
        crate::bootstrap::BootstrapTool::Zypper,
    ))
}

fn arch() -> Box<dyn ConveyorPacker> {
    Box::new(crate::bootstrap::OsBootstrapConveyorPacker::new(
        crate::bootstrap::BootstrapTool::Arch,
    ))
}

fn busybox() -> Box<dyn ConveyorPacker> {
    Box::new(crate::bootstrap::OsBootstrapConveyorPacker::new(
        crate::bootstrap::BootstrapTool::Busybox,
    ))
}

/// Look up the conveyor-packer for a `bootstrap` header value.
pub fn select_conveyor_packer(bootstrap: &str) -> Result<Box<dyn ConveyorPacker>, RuntimeError> {
    let key = bootstrap.trim().to_ascii_lowercase();
    REGISTRY
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, make)| make())
        .ok_or_else(|| RuntimeError::UnknownBootstrap(bootstrap.to_owned()))
}

/// Every bootstrap keyword the registry knows.
pub fn registered_bootstraps() -> impl Iterator<Item = &'static str> {
    REGISTRY.iter().map(|(name, _)| *name)
}

const BASE_ENV: &str = "#!/bin/sh\n";

const BASE_ENV_LAST: &str = r#"#!/bin/sh
if [ -z "$LD_LIBRARY_PATH" ]; then
    LD_LIBRARY_PATH="/.singularity.d/libs"
else
    LD_LIBRARY_PATH="$LD_LIBRARY_PATH:/.singularity.d/libs"
fi

PS1="Kiln> "
export LD_LIBRARY_PATH PS1
"#;

const PLACEHOLDER_RUNSCRIPT: &str = "#!/bin/sh\n\n";

const MOUNT_POINTS: &[&str] = &["proc", "sys", "dev", "tmp", "home", "root", "etc", "var/tmp"];

/// Lay down the minimal image skeleton every source shares.
///
/// Existing files (from a fetched base image) are left alone, so packing an
/// image that already carries metadata keeps it.
pub fn pack_base(bundle: &mut Bundle) -> Result<(), RuntimeError> {
    let layout = bundle.layout().clone();
    let rootfs = layout.rootfs();
    debug!("packing base skeleton into {}", rootfs.display());

    let meta = layout.metadata_dir();
    for sub in ["env", "actions", "libs"] {
        fs::create_dir_all(meta.join(sub))?;
    }
    for dir in MOUNT_POINTS {
        fs::create_dir_all(rootfs.join(dir))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(rootfs.join("tmp"), fs::Permissions::from_mode(0o1777))?;
        fs::set_permissions(rootfs.join("var/tmp"), fs::Permissions::from_mode(0o1777))?;
    }

    write_if_missing(&layout.env_dir().join("01-base.sh"), BASE_ENV, 0o755)?;
    write_if_missing(&layout.env_dir().join("99-base.sh"), BASE_ENV_LAST, 0o755)?;
    write_if_missing(&layout.runscript(), PLACEHOLDER_RUNSCRIPT, 0o755)?;

    for bind_target in ["etc/hosts", "etc/resolv.conf"] {
        let path = rootfs.join(bind_target);
        if fs::symlink_metadata(&path).is_err() {
            fs::write(&path, "")?;
        }
    }

    #[cfg(unix)]
    {
        let link = rootfs.join("singularity");
        if fs::symlink_metadata(&link).is_err() {
            std::os::unix::fs::symlink(".singularity.d/runscript", link)?;
        }
    }
    Ok(())
}

fn write_if_missing(path: &Path, content: &str, mode: u32) -> Result<(), RuntimeError> {
    if fs::symlink_metadata(path).is_ok() {
        return Ok(());
    }
    write_atomic(path, content.as_bytes(), mode)?;
    Ok(())
}
