use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, Once, PoisonError};
use tracing::{debug, warn};

/// Exclusive lock held while a build writes a destination, so two builds
/// never assemble into the same path at once.
pub struct BuildLock {
    lock_file: File,
}

impl BuildLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, CoreError> {
        let file = open_lock_file(lock_path)?;
        file.lock_exclusive()
            .map_err(|e| CoreError::Io(std::io::Error::new(std::io::ErrorKind::WouldBlock, e)))?;
        Ok(Self { lock_file: file })
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = open_lock_file(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }

    /// Lock file for a destination, kept under the build temp directory.
    pub fn path_for(tmp_dir: &Path, dest: &Path) -> PathBuf {
        let abs = std::path::absolute(dest).unwrap_or_else(|_| dest.to_path_buf());
        let key = blake3::hash(abs.to_string_lossy().as_bytes()).to_hex();
        tmp_dir.join(".kiln-locks").join(format!("{}.lock", &key.as_str()[..16]))
    }
}

fn open_lock_file(lock_path: &Path) -> Result<File, CoreError> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?)
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.lock_file);
    }
}

const NO_SAVED_UMASK: u32 = u32::MAX;
static SAVED_UMASK: AtomicU32 = AtomicU32::new(NO_SAVED_UMASK);

/// Safe wrapper around libc::umask().
#[allow(unsafe_code)]
fn set_umask(mask: u32) -> u32 {
    // SAFETY: umask() only swaps the process file mode creation mask and
    // cannot fail.
    u32::from(unsafe { libc::umask(mask as libc::mode_t) })
}

/// Sets the process umask for the lifetime of the guard and restores the
/// previous one on drop, including on early return.
pub struct UmaskGuard {
    previous: u32,
}

impl UmaskGuard {
    pub fn set(mask: u32) -> Self {
        let previous = set_umask(mask);
        SAVED_UMASK.store(previous, Ordering::SeqCst);
        debug!("umask set to {mask:04o} (was {previous:04o})");
        Self { previous }
    }

    pub fn previous(&self) -> u32 {
        self.previous
    }
}

impl Drop for UmaskGuard {
    fn drop(&mut self) {
        set_umask(self.previous);
        SAVED_UMASK.store(NO_SAVED_UMASK, Ordering::SeqCst);
    }
}

/// Work to run before a bundle is deleted on interrupt, such as releasing a
/// mount that lives inside it.
pub type CleanupHook = Box<dyn FnOnce() + Send>;

struct CleanupEntry {
    path: PathBuf,
    hooks: Vec<CleanupHook>,
}

/// Bundles (and their hooks) to tear down if the build is interrupted.
pub(crate) struct CleanupRegistry {
    entries: Mutex<Vec<CleanupEntry>>,
}

impl CleanupRegistry {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<CleanupEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, path: &Path) {
        let mut entries = self.entries();
        if !entries.iter().any(|e| e.path == path) {
            entries.push(CleanupEntry {
                path: path.to_path_buf(),
                hooks: Vec::new(),
            });
        }
    }

    pub(crate) fn add_hook(&self, path: &Path, hook: CleanupHook) {
        let mut entries = self.entries();
        match entries.iter_mut().find(|e| e.path == path) {
            Some(entry) => entry.hooks.push(hook),
            None => entries.push(CleanupEntry {
                path: path.to_path_buf(),
                hooks: vec![hook],
            }),
        }
    }

    pub(crate) fn clear_hooks(&self, path: &Path) {
        if let Some(entry) = self.entries().iter_mut().find(|e| e.path == path) {
            entry.hooks.clear();
        }
    }

    pub(crate) fn unregister(&self, path: &Path) {
        self.entries().retain(|e| e.path != path);
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, path: &Path) -> bool {
        self.entries().iter().any(|e| e.path == path)
    }

    /// Run every hook, then delete every registered bundle.
    pub(crate) fn drain(&self) {
        let entries = std::mem::take(&mut *self.entries());
        for entry in entries {
            for hook in entry.hooks {
                hook();
            }
            if let Err(e) = kiln_bundle::force_remove(&entry.path) {
                warn!("cleanup of {} failed: {e}", entry.path.display());
            }
        }
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);
static CLEANUP_STARTED: AtomicBool = AtomicBool::new(false);
static CLEANUP: CleanupRegistry = CleanupRegistry::new();
static HANDLER: Once = Once::new();

/// Remember a bundle to delete if the build is interrupted.
pub fn register_cleanup(path: &Path) {
    CLEANUP.register(path);
}

/// Run `hook` before the bundle at `path` is deleted on interrupt.
pub fn register_cleanup_hook(path: &Path, hook: CleanupHook) {
    CLEANUP.add_hook(path, hook);
}

/// Drop the hooks of a bundle whose resources were released normally.
pub fn clear_cleanup_hooks(path: &Path) {
    CLEANUP.clear_hooks(path);
}

/// Forget a bundle that has been removed (or is being kept) normally.
pub fn unregister_cleanup(path: &Path) {
    CLEANUP.unregister(path);
}

/// Release and delete everything in `registry`.
fn run_interrupt_cleanup(registry: &CleanupRegistry) {
    registry.drain();
}

/// Install the SIGINT/SIGTERM handler. The first signal runs the registered
/// hooks, deletes registered bundles, restores the umask and exits with
/// status 130.
pub fn install_signal_handler() {
    HANDLER.call_once(|| {
        let result = ctrlc::set_handler(move || {
            SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
            eprintln!("\nbuild interrupted, cleaning up...");
            if !CLEANUP_STARTED.swap(true, Ordering::SeqCst) {
                run_interrupt_cleanup(&CLEANUP);
                let saved = SAVED_UMASK.swap(NO_SAVED_UMASK, Ordering::SeqCst);
                if saved != NO_SAVED_UMASK {
                    set_umask(saved);
                }
            }
            std::process::exit(130);
        });
        if let Err(e) = result {
            warn!("could not install signal handler: {e}");
        }
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("locks/test.lock");
        {
            let _lock = BuildLock::acquire(&lock_path).unwrap();
            assert!(lock_path.exists());
        }
        assert!(BuildLock::try_acquire(&lock_path).unwrap().is_some());
    }

    #[test]
    fn try_acquire_returns_none_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let lock_path = dir.path().join("test.lock");
        let _lock = BuildLock::acquire(&lock_path).unwrap();
        assert!(BuildLock::try_acquire(&lock_path).unwrap().is_none());
    }

    #[test]
    fn lock_path_depends_on_destination() {
        let tmp = Path::new("/tmp");
        let a = BuildLock::path_for(tmp, Path::new("/out/a.sif"));
        let b = BuildLock::path_for(tmp, Path::new("/out/b.sif"));
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp/.kiln-locks"));
    }

    #[test]
    fn umask_guard_restores_previous_mask() {
        let before = set_umask(0o022);
        set_umask(before);
        {
            let guard = UmaskGuard::set(0o022);
            assert_eq!(guard.previous(), before);
        }
        let after = set_umask(before);
        assert_eq!(after, before);
    }

    #[test]
    fn registry_forgets_unregistered_paths() {
        let path = PathBuf::from("/nonexistent/kiln-registry-test");
        register_cleanup(&path);
        assert!(CLEANUP.contains(&path));
        unregister_cleanup(&path);
        assert!(!CLEANUP.contains(&path));
    }

    #[test]
    fn interrupt_cleanup_runs_hooks_before_removing_bundle() {
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("build-temp-x");
        let mnt = bundle.join("tmp/ext3-x");
        std::fs::create_dir_all(&mnt).unwrap();
        std::fs::write(mnt.join("busy"), "x").unwrap();

        let registry = CleanupRegistry::new();
        registry.register(&bundle);
        let seen = Arc::new(Mutex::new(None));
        let seen_by_hook = Arc::clone(&seen);
        let hook_mnt = mnt.clone();
        registry.add_hook(
            &bundle,
            Box::new(move || {
                *seen_by_hook.lock().unwrap() = Some(hook_mnt.join("busy").exists());
                std::fs::remove_file(hook_mnt.join("busy")).unwrap();
            }),
        );

        run_interrupt_cleanup(&registry);

        assert_eq!(*seen.lock().unwrap(), Some(true));
        assert!(!bundle.exists());
        assert!(!registry.contains(&bundle));
    }

    #[test]
    fn cleared_hooks_do_not_run() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("b");
        std::fs::create_dir_all(&bundle).unwrap();

        let registry = CleanupRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.add_hook(
            &bundle,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.clear_hooks(&bundle);
        run_interrupt_cleanup(&registry);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!bundle.exists());
    }
}
