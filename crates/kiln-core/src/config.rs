use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// User defaults for builds, read from `~/.config/kiln/build.json`.
///
/// Every field is optional. Environment variables (`KILN_TMPDIR`,
/// `KILN_CACHEDIR`, `KILN_NOCLEANUP`) override the file, and command-line
/// flags override both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub disable_cache: bool,
    #[serde(default)]
    pub sections: Option<Vec<String>>,
    #[serde(default)]
    pub no_cleanup: bool,
    #[serde(default)]
    pub default_format: Option<String>,
    #[serde(default)]
    pub allowed_env: Vec<String>,
}

impl BuildConfig {
    /// Load `~/.config/kiln/build.json`; a missing file yields defaults.
    pub fn load_default() -> Result<Self, CoreError> {
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            CoreError::Validation(format!("invalid build config {}: {e}", path.display()))
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `KILN_*` overrides read through `lookup`.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup("KILN_TMPDIR").filter(|v| !v.is_empty()) {
            self.tmp_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("KILN_CACHEDIR").filter(|v| !v.is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        if let Some(flag) = lookup("KILN_NOCLEANUP") {
            self.no_cleanup = matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        self
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Image cache root, or `None` when caching is disabled.
    pub fn cache_dir(&self) -> Option<PathBuf> {
        if self.disable_cache {
            return None;
        }
        self.cache_dir.clone().or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".cache/kiln"))
        })
    }
}

fn default_config_path() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".config/kiln/build.json"))
}
