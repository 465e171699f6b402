use crate::BundleError;
use kiln_schema::SectionKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Key material handed to an assembler that supports encrypted images.
#[derive(Clone, PartialEq, Eq)]
pub enum EncryptionKey {
    Passphrase(String),
    PemFile(PathBuf),
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passphrase(_) => f.write_str("Passphrase(<redacted>)"),
            Self::PemFile(path) => f.debug_tuple("PemFile").field(path).finish(),
        }
    }
}

/// Build options carried by every bundle of a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Section filter tokens: `all`, `none`, or section names.
    #[serde(default = "default_sections")]
    pub sections: Vec<String>,
    /// Image cache for conveyors that download content.
    #[serde(default)]
    pub image_cache: Option<PathBuf>,
    /// Keep bundle working trees after the build.
    #[serde(default)]
    pub no_cleanup: bool,
    /// Let newer labels and files overwrite existing ones.
    #[serde(default)]
    pub force: bool,
    /// Build on top of an existing image instead of starting over.
    #[serde(default)]
    pub update: bool,
    /// Skip the `%test` section.
    #[serde(default)]
    pub no_test: bool,
    /// Allow plain-http downloads.
    #[serde(default)]
    pub no_https: bool,
    /// Extra host variables passed into build scriptlets.
    #[serde(default)]
    pub allowed_env: Vec<String>,
    #[serde(skip)]
    pub encryption_key: Option<EncryptionKey>,
}

fn default_sections() -> Vec<String> {
    vec!["all".to_owned()]
}

impl Default for Options {
    fn default() -> Self {
        Self {
            sections: default_sections(),
            image_cache: None,
            no_cleanup: false,
            force: false,
            update: false,
            no_test: false,
            no_https: false,
            allowed_env: Vec::new(),
            encryption_key: None,
        }
    }
}

impl Options {
    /// Whether the named section should run for this build.
    ///
    /// `none` anywhere in the list disables every section. Otherwise `all` or
    /// an exact match enables it; anything else does not run.
    pub fn run_section(&self, name: &str) -> bool {
        if self.sections.iter().any(|s| s == "none") {
            return false;
        }
        self.sections.iter().any(|s| s == "all" || s == name)
    }

    /// Reject contradictory or unknown section tokens.
    pub fn validate(&self) -> Result<(), BundleError> {
        let has_all = self.sections.iter().any(|s| s == "all");
        let has_none = self.sections.iter().any(|s| s == "none");
        if has_all && has_none {
            return Err(BundleError::InvalidSections(
                "'all' and 'none' are mutually exclusive".to_owned(),
            ));
        }
        for token in &self.sections {
            let known = token == "all"
                || token == "none"
                || matches!(SectionKind::from_name(token), Some(k) if !matches!(k, SectionKind::App(_)));
            if !known {
                return Err(BundleError::InvalidSections(format!(
                    "unknown section '{token}'"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_sections(tokens: &[&str]) -> Options {
        Options {
            sections: tokens.iter().map(|s| (*s).to_owned()).collect(),
            ..Options::default()
        }
    }

    #[test]
    fn default_runs_everything() {
        let opts = Options::default();
        assert!(opts.run_section("post"));
        assert!(opts.run_section("files"));
    }

    #[test]
    fn none_disables_everything_regardless_of_position() {
        for tokens in [&["none"][..], &["post", "none"], &["none", "post"]] {
            let opts = with_sections(tokens);
            for name in ["post", "setup", "files", "test", "labels"] {
                assert!(!opts.run_section(name), "{tokens:?} ran {name}");
            }
        }
    }

    #[test]
    fn exact_match_enables_only_named() {
        let opts = with_sections(&["post", "files"]);
        assert!(opts.run_section("post"));
        assert!(opts.run_section("files"));
        assert!(!opts.run_section("setup"));
    }

    #[test]
    fn empty_list_runs_nothing() {
        assert!(!with_sections(&[]).run_section("post"));
    }

    #[test]
    fn all_and_none_is_a_configuration_error() {
        assert!(with_sections(&["all", "none"]).validate().is_err());
        assert!(with_sections(&["all"]).validate().is_ok());
        assert!(with_sections(&["post", "test"]).validate().is_ok());
    }

    #[test]
    fn unknown_section_token_is_rejected() {
        assert!(with_sections(&["postt"]).validate().is_err());
        assert!(with_sections(&["appinstall"]).validate().is_err());
    }

    #[test]
    fn encryption_key_debug_is_redacted() {
        let key = EncryptionKey::Passphrase("hunter2".to_owned());
        assert!(!format!("{key:?}").contains("hunter2"));
    }
}
