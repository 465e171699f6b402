use crate::layout::BundleLayout;
use crate::options::{EncryptionKey, Options};
use crate::BundleError;
use kiln_schema::Definition;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// An in-progress image build: a temporary working tree plus the recipe and
/// options that drive it.
///
/// The working tree is never removed implicitly. Whoever owns the bundle
/// calls [`remove`](Self::remove) once the build is over, unless the user
/// asked to keep it.
#[derive(Debug)]
pub struct Bundle {
    layout: BundleLayout,
    pub recipe: Definition,
    pub opts: Options,
    removed: bool,
}

impl Bundle {
    /// Create a uniquely named working tree `<parent>/<prefix>XXXXXX`.
    pub fn new(parent: &Path, prefix: &str) -> Result<Self, BundleError> {
        std::fs::create_dir_all(parent).map_err(|e| BundleError::CreateFailed {
            path: parent.to_path_buf(),
            source: e,
        })?;

        let root = tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(parent)
            .map_err(|e| BundleError::CreateFailed {
                path: parent.to_path_buf(),
                source: e,
            })?
            .keep();

        let layout = BundleLayout::new(&root);
        if let Err(e) = layout.initialize() {
            let _ = std::fs::remove_dir_all(&root);
            return Err(e);
        }
        debug!("created bundle {}", root.display());

        Ok(Self {
            layout,
            recipe: Definition::default(),
            opts: Options::default(),
            removed: false,
        })
    }

    /// Same as [`new`](Self::new), with the key the assembler will encrypt with.
    pub fn new_encrypted(
        parent: &Path,
        prefix: &str,
        key: EncryptionKey,
    ) -> Result<Self, BundleError> {
        let mut bundle = Self::new(parent, prefix)?;
        bundle.opts.encryption_key = Some(key);
        Ok(bundle)
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.layout.root()
    }

    #[inline]
    pub fn layout(&self) -> &BundleLayout {
        &self.layout
    }

    /// Always `<path>/fs`.
    #[inline]
    pub fn rootfs(&self) -> PathBuf {
        self.layout.rootfs()
    }

    #[inline]
    pub fn tmp_dir(&self) -> PathBuf {
        self.layout.tmp_dir()
    }

    pub fn run_section(&self, name: &str) -> bool {
        self.opts.run_section(name)
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    /// Delete the working tree. Later calls are no-ops.
    pub fn remove(&mut self) -> Result<(), BundleError> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        debug!("removing bundle {}", self.path().display());
        force_remove(self.path())
    }
}

/// Remove a tree, first making every directory in it writable so images
/// with read-only directories can be deleted.
pub fn force_remove(path: &Path) -> Result<(), BundleError> {
    if !path.exists() {
        return Ok(());
    }
    if std::fs::remove_dir_all(path).is_ok() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for entry in walkdir::WalkDir::new(path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_dir())
        {
            if let Ok(meta) = entry.metadata() {
                let mut perms = meta.permissions();
                perms.set_mode(perms.mode() | 0o700);
                if let Err(e) = std::fs::set_permissions(entry.path(), perms) {
                    warn!("cannot make {} writable: {e}", entry.path().display());
                }
            }
        }
    }

    std::fs::remove_dir_all(path).map_err(|e| BundleError::RemoveFailed {
        path: path.to_path_buf(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_bundle_has_rootfs_under_path() {
        let parent = tempfile::tempdir().unwrap();
        let bundle = Bundle::new(parent.path(), "build-temp-").unwrap();
        assert!(bundle.path().starts_with(parent.path()));
        assert!(bundle
            .path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("build-temp-"));
        assert_eq!(bundle.rootfs(), bundle.path().join("fs"));
        assert!(bundle.rootfs().is_dir());
        assert!(bundle.tmp_dir().is_dir());
    }

    #[test]
    fn bundles_are_unique() {
        let parent = tempfile::tempdir().unwrap();
        let a = Bundle::new(parent.path(), "b-").unwrap();
        let b = Bundle::new(parent.path(), "b-").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn new_creates_missing_parent() {
        let parent = tempfile::tempdir().unwrap();
        let nested = parent.path().join("a/b/c");
        let bundle = Bundle::new(&nested, "b-").unwrap();
        assert!(bundle.path().starts_with(&nested));
    }

    #[test]
    fn new_fails_when_parent_cannot_be_created() {
        let parent = tempfile::tempdir().unwrap();
        let file = parent.path().join("not-a-dir");
        std::fs::write(&file, "x").unwrap();
        let err = Bundle::new(&file.join("sub"), "b-").unwrap_err();
        assert!(matches!(err, BundleError::CreateFailed { .. }));
    }

    #[test]
    fn encrypted_bundle_carries_key() {
        let parent = tempfile::tempdir().unwrap();
        let key = EncryptionKey::PemFile(PathBuf::from("/keys/pub.pem"));
        let bundle = Bundle::new_encrypted(parent.path(), "b-", key.clone()).unwrap();
        assert_eq!(bundle.opts.encryption_key, Some(key));
    }

    #[test]
    fn remove_is_idempotent() {
        let parent = tempfile::tempdir().unwrap();
        let mut bundle = Bundle::new(parent.path(), "b-").unwrap();
        let path = bundle.path().to_path_buf();
        bundle.remove().unwrap();
        assert!(!path.exists());
        assert!(bundle.is_removed());
        bundle.remove().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn remove_handles_read_only_directories() {
        use std::os::unix::fs::PermissionsExt;
        let parent = tempfile::tempdir().unwrap();
        let mut bundle = Bundle::new(parent.path(), "b-").unwrap();
        let locked = bundle.rootfs().join("usr/share");
        std::fs::create_dir_all(&locked).unwrap();
        std::fs::write(locked.join("file"), "x").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();
        let path = bundle.path().to_path_buf();
        bundle.remove().unwrap();
        assert!(!path.exists());
    }
}
