use crate::RuntimeError;
use std::fs;
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Copy a directory tree, keeping symlinks as symlinks and file modes.
///
/// Existing files at the destination are replaced; existing directories are
/// merged into.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), RuntimeError> {
    debug!("copying tree {} -> {}", src.display(), dst.display());
    let mut dirs = Vec::new();
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| RuntimeError::Io(e.into()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;
        let target = dst.join(rel);
        let ft = entry.file_type();
        if ft.is_dir() {
            fs::create_dir_all(&target)?;
            let meta = entry.metadata().map_err(|e| RuntimeError::Io(e.into()))?;
            dirs.push((target, meta.permissions()));
        } else if ft.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            replace_file(entry.path(), &target)?;
        }
    }
    // Directory modes last, so read-only directories are still filled.
    for (dir, perms) in dirs.into_iter().rev() {
        fs::set_permissions(dir, perms)?;
    }
    Ok(())
}

/// Copy a file or directory the way `cp -r src dst` does: a directory copied
/// onto an existing directory lands inside it under its own name, a file
/// copied onto a directory keeps its name.
pub fn copy_path(src: &Path, dst: &Path) -> Result<(), RuntimeError> {
    let meta = fs::symlink_metadata(src)?;
    let target = if dst.is_dir() {
        match src.file_name() {
            Some(name) => dst.join(name),
            None => dst.to_path_buf(),
        }
    } else {
        dst.to_path_buf()
    };

    if meta.is_dir() {
        return copy_tree(src, &target);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    if meta.file_type().is_symlink() {
        copy_symlink(src, &target)
    } else {
        replace_file(src, &target)
    }
}

fn replace_file(src: &Path, dst: &Path) -> Result<(), RuntimeError> {
    if fs::symlink_metadata(dst).is_ok_and(|m| m.file_type().is_symlink()) {
        fs::remove_file(dst)?;
    }
    fs::copy(src, dst)?;
    Ok(())
}

fn copy_symlink(src: &Path, dst: &Path) -> Result<(), RuntimeError> {
    let link = fs::read_link(src)?;
    if let Ok(existing) = fs::symlink_metadata(dst) {
        if existing.is_dir() {
            fs::remove_dir_all(dst)?;
        } else {
            fs::remove_file(dst)?;
        }
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(&link, dst)?;
    #[cfg(not(unix))]
    let _ = link;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_tree_preserves_structure_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("usr/bin")).unwrap();
        fs::write(src.join("usr/bin/tool"), "#!/bin/sh\n").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("usr/bin", src.join("bin")).unwrap();

        let dst = dir.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(
            fs::read_to_string(dst.join("usr/bin/tool")).unwrap(),
            "#!/bin/sh\n"
        );
        #[cfg(unix)]
        assert_eq!(fs::read_link(dst.join("bin")).unwrap(), Path::new("usr/bin"));
    }

    #[test]
    fn copy_tree_merges_into_existing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::create_dir_all(dst.join("etc")).unwrap();
        fs::write(src.join("etc/a"), "new").unwrap();
        fs::write(dst.join("etc/a"), "old").unwrap();
        fs::write(dst.join("etc/b"), "keep").unwrap();
        copy_tree(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("etc/a")).unwrap(), "new");
        assert_eq!(fs::read_to_string(dst.join("etc/b")).unwrap(), "keep");
    }

    #[test]
    fn copy_path_file_into_directory_keeps_name() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hello.txt");
        fs::write(&file, "hi").unwrap();
        let dst = dir.path().join("opt");
        fs::create_dir_all(&dst).unwrap();
        copy_path(&file, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("hello.txt")).unwrap(), "hi");
    }

    #[test]
    fn copy_path_file_to_new_name() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hello.txt");
        fs::write(&file, "hi").unwrap();
        let dst = dir.path().join("deep/renamed.txt");
        copy_path(&file, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst).unwrap(), "hi");
    }

    #[test]
    fn copy_path_directory_into_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("data");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("f"), "x").unwrap();
        let dst = dir.path().join("opt");
        fs::create_dir_all(&dst).unwrap();
        copy_path(&src, &dst).unwrap();
        assert!(dst.join("data/f").is_file());
    }

    #[test]
    fn copy_path_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(copy_path(&dir.path().join("nope"), &dir.path().join("x")).is_err());
    }
}
