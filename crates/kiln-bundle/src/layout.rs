use crate::BundleError;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;

/// Image metadata directory, relative to the rootfs.
pub const METADATA_DIR: &str = ".singularity.d";
/// SCI-F app root, relative to the rootfs.
pub const SCIF_APPS_DIR: &str = "scif/apps";
/// SCI-F app data root, relative to the rootfs.
pub const SCIF_DATA_DIR: &str = "scif/data";

/// Directory layout of a bundle working tree.
///
/// ```text
/// <root>/fs                    rootfs of the image being built
/// <root>/fs/.singularity.d     image metadata
/// <root>/tmp                   scratch space (session files, downloads)
/// ```
#[derive(Debug, Clone)]
pub struct BundleLayout {
    root: PathBuf,
}

impl BundleLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn rootfs(&self) -> PathBuf {
        self.root.join("fs")
    }

    #[inline]
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    #[inline]
    pub fn metadata_dir(&self) -> PathBuf {
        self.rootfs().join(METADATA_DIR)
    }

    #[inline]
    pub fn env_dir(&self) -> PathBuf {
        self.metadata_dir().join("env")
    }

    #[inline]
    pub fn labels_file(&self) -> PathBuf {
        self.metadata_dir().join("labels.json")
    }

    #[inline]
    pub fn definition_file(&self) -> PathBuf {
        self.metadata_dir().join("Singularity")
    }

    #[inline]
    pub fn bootstrap_history_dir(&self) -> PathBuf {
        self.metadata_dir().join("bootstrap_history")
    }

    #[inline]
    pub fn runscript(&self) -> PathBuf {
        self.metadata_dir().join("runscript")
    }

    #[inline]
    pub fn runscript_help(&self) -> PathBuf {
        self.metadata_dir().join("runscript.help")
    }

    #[inline]
    pub fn startscript(&self) -> PathBuf {
        self.metadata_dir().join("startscript")
    }

    #[inline]
    pub fn test_script(&self) -> PathBuf {
        self.metadata_dir().join("test")
    }

    /// Custom `%environment` content.
    #[inline]
    pub fn environment_script(&self) -> PathBuf {
        self.env_dir().join("90-environment.sh")
    }

    /// Where `%post` may append with `$SINGULARITY_ENVIRONMENT`.
    #[inline]
    pub fn post_environment_script(&self) -> PathBuf {
        self.env_dir().join("91-environment.sh")
    }

    /// Global app environment aggregator.
    #[inline]
    pub fn apps_env_script(&self) -> PathBuf {
        self.env_dir().join("94-appsbase.sh")
    }

    #[inline]
    pub fn app_root(&self, app: &str) -> PathBuf {
        self.rootfs().join(SCIF_APPS_DIR).join(app)
    }

    #[inline]
    pub fn app_data(&self, app: &str) -> PathBuf {
        self.rootfs().join(SCIF_DATA_DIR).join(app)
    }

    /// Resolve an in-image path (`/etc/hosts`) under the rootfs.
    pub fn in_rootfs(&self, path: impl AsRef<Path>) -> PathBuf {
        confine(&self.rootfs(), path)
    }

    pub fn initialize(&self) -> Result<(), BundleError> {
        fs::create_dir_all(self.rootfs())?;
        fs::create_dir_all(self.tmp_dir())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(self.rootfs(), fs::Permissions::from_mode(0o755))?;
            fs::set_permissions(self.tmp_dir(), fs::Permissions::from_mode(0o700))?;
        }
        Ok(())
    }
}

/// Join `path` onto `root` as if `root` were `/`: the result never climbs
/// above `root`, as with `/..` inside a chroot.
pub fn confine(root: &Path, path: impl AsRef<Path>) -> PathBuf {
    let mut inner = PathBuf::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(part) => inner.push(part),
            Component::ParentDir => {
                inner.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    root.join(inner)
}

/// Write `content` to `path` through a temp file in the same directory and
/// rename it into place, then apply `mode`.
pub fn write_atomic(path: &Path, content: &[u8], mode: u32) -> Result<(), BundleError> {
    let dir = path
        .parent()
        .ok_or_else(|| BundleError::InvalidPath(path.to_path_buf()))?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| BundleError::Io(e.error))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}
