use crate::conveyor::ConveyorPacker;
use crate::localimage::LocalImageConveyorPacker;
use crate::RuntimeError;
use fs2::FileExt;
use kiln_bundle::Bundle;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

/// Downloaded base images, keyed by the blake3 digest of their URL.
pub struct ImageCache {
    cache_dir: PathBuf,
}

impl ImageCache {
    pub fn new(cache_root: &Path) -> Self {
        Self {
            cache_dir: cache_root.join("downloads"),
        }
    }

    pub fn cache_key(url: &str) -> String {
        blake3::hash(url.as_bytes()).to_hex().to_string()
    }

    pub fn image_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(Self::cache_key(url)).join("image")
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.image_path(url).is_file()
    }

    /// Return the cached file for `url`, downloading it first if needed.
    ///
    /// Concurrent builds fetching the same URL serialize on a lock file in
    /// the entry directory.
    pub fn ensure_image(&self, url: &str) -> Result<PathBuf, RuntimeError> {
        let image = self.image_path(url);
        let entry = image
            .parent()
            .ok_or_else(|| RuntimeError::ExecFailed(format!("bad cache path {}", image.display())))?;
        fs::create_dir_all(entry)?;

        let lock = File::create(entry.join(".lock"))?;
        lock.lock_exclusive()?;

        if image.is_file() {
            info!("using cached image for {url}");
            return Ok(image);
        }

        let partial = entry.join("image.partial");
        info!("downloading {url}");
        let output = Command::new("curl")
            .args(["-fSL", "--max-time", "1800", "-o"])
            .arg(&partial)
            .arg(url)
            .output()
            .map_err(|e| RuntimeError::Download {
                url: url.to_owned(),
                reason: format!("curl not found or failed to start: {e}"),
            })?;

        if !output.status.success() {
            let _ = fs::remove_file(&partial);
            return Err(RuntimeError::Download {
                url: url.to_owned(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        fs::rename(&partial, &image)?;
        debug!("cached {url} at {}", image.display());
        Ok(image)
    }
}

/// Resolve a `library`/`shub` reference to a download URL.
///
/// Only direct http(s) locations are supported: either `from` is already a
/// URL, or the `library` header gives a base URL that `from` is joined onto.
pub fn resolve_url(
    kind: &str,
    header: &std::collections::BTreeMap<String, String>,
    allow_http: bool,
) -> Result<String, RuntimeError> {
    let from = header
        .get("from")
        .map(|f| f.trim())
        .filter(|f| !f.is_empty())
        .ok_or_else(|| RuntimeError::MissingHeader {
            bootstrap: kind.to_owned(),
            key: "from".to_owned(),
        })?;

    let from = from
        .strip_prefix("library://")
        .or_else(|| from.strip_prefix("shub://"))
        .unwrap_or(from);

    let url = if is_http_url(from) {
        from.to_owned()
    } else {
        match header.get("library").map(|l| l.trim()) {
            Some(base) if is_http_url(base) => {
                format!("{}/{}", base.trim_end_matches('/'), from.trim_start_matches('/'))
            }
            _ => {
                return Err(RuntimeError::UnsupportedSource(format!(
                    "{kind} reference '{from}' needs an http(s) URL in 'from' or 'library'"
                )))
            }
        }
    };

    if url.starts_with("http://") && !allow_http {
        return Err(RuntimeError::UnsupportedSource(format!(
            "refusing plain http download of {url} (use --nohttps to allow)"
        )));
    }
    Ok(url)
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("https://") || s.starts_with("http://")
}

/// `bootstrap: library` and `bootstrap: shub`: download an image file into
/// the cache, then unpack it like a local image.
pub struct DownloadConveyorPacker {
    kind: &'static str,
    local: LocalImageConveyorPacker,
}

impl DownloadConveyorPacker {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            local: LocalImageConveyorPacker::default(),
        }
    }
}

impl ConveyorPacker for DownloadConveyorPacker {
    fn name(&self) -> &'static str {
        self.kind
    }

    fn requires_cache(&self) -> bool {
        true
    }

    fn get(&mut self, bundle: &mut Bundle) -> Result<(), RuntimeError> {
        let cache_root = bundle
            .opts
            .image_cache
            .clone()
            .ok_or_else(|| RuntimeError::CacheRequired(self.kind.to_owned()))?;
        let url = resolve_url(self.kind, &bundle.recipe.header, bundle.opts.no_https)?;
        let image = ImageCache::new(&cache_root).ensure_image(&url)?;
        self.local.extract(&image, bundle)
    }

    fn mount_points(&self) -> Vec<PathBuf> {
        self.local.mount_points()
    }

    fn clean_up(&mut self) -> Result<(), RuntimeError> {
        self.local.clean_up()
    }
}
