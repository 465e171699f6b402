use crate::RuntimeError;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Mount options of the filesystem holding a path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountFlags {
    pub noexec: bool,
    pub nodev: bool,
}

/// Safe wrapper around libc::statvfs().
#[allow(unsafe_code)]
fn statvfs_flags(path: &Path) -> Result<libc::c_ulong, RuntimeError> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| RuntimeError::ExecFailed(format!("path contains NUL: {}", path.display())))?;
    let mut buf = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    // SAFETY: c_path is a valid NUL-terminated string and buf points to
    // writable memory sized for a statvfs struct.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), buf.as_mut_ptr()) };
    if rc != 0 {
        return Err(RuntimeError::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: statvfs returned 0, so it initialized buf.
    let stat = unsafe { buf.assume_init() };
    Ok(stat.f_flag)
}

/// Nearest existing ancestor, so a destination that is not created yet is
/// judged by the filesystem it will land on.
fn existing_ancestor(path: &Path) -> PathBuf {
    let mut cur = path;
    loop {
        if cur.exists() {
            return cur.to_path_buf();
        }
        match cur.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => cur = parent,
            _ => return PathBuf::from("."),
        }
    }
}

pub fn mount_flags(path: &Path) -> Result<MountFlags, RuntimeError> {
    let flags = statvfs_flags(&existing_ancestor(path))?;
    Ok(MountFlags {
        noexec: flags & libc::ST_NOEXEC != 0,
        nodev: flags & libc::ST_NODEV != 0,
    })
}

/// Fail if scripts could not be executed from `path`; warn on `nodev`.
pub fn check_exec_allowed(path: &Path) -> Result<MountFlags, RuntimeError> {
    let flags = mount_flags(path)?;
    if flags.noexec {
        return Err(RuntimeError::NoExecMount(path.to_path_buf()));
    }
    if flags.nodev {
        warn!(
            "{} is mounted nodev; device files in the image will not work during the build",
            path.display()
        );
    }
    Ok(flags)
}
