//! Section and header vocabulary of the definition file format.
//!
//! Section names are resolved to a [`SectionKind`] once, at parse time. App
//! sections carry their app name as a separate field instead of being folded
//! into a string key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Header keys accepted in the block before the first section.
pub const HEADER_KEYS: &[&str] = &[
    "bootstrap",
    "from",
    "includecmd",
    "mirrorurl",
    "updateurl",
    "osversion",
    "include",
    "library",
    "registry",
    "namespace",
    "stage",
];

pub fn is_header_key(key: &str) -> bool {
    HEADER_KEYS.contains(&key)
}

/// Sections that apply to a named SCI-F app (`%appinstall NAME`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppSectionKind {
    Install,
    Files,
    Env,
    Test,
    Help,
    Run,
    Start,
    Labels,
}

impl AppSectionKind {
    pub const ALL: [Self; 8] = [
        Self::Install,
        Self::Files,
        Self::Env,
        Self::Test,
        Self::Help,
        Self::Run,
        Self::Start,
        Self::Labels,
    ];

    pub fn section_name(self) -> &'static str {
        match self {
            Self::Install => "appinstall",
            Self::Files => "appfiles",
            Self::Env => "appenv",
            Self::Test => "apptest",
            Self::Help => "apphelp",
            Self::Run => "apprun",
            Self::Start => "appstart",
            Self::Labels => "applabels",
        }
    }
}

/// Every section name the parser recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    Help,
    Setup,
    Files,
    Labels,
    Environment,
    Pre,
    Post,
    Runscript,
    Test,
    Startscript,
    App(AppSectionKind),
}

impl SectionKind {
    /// Look up a lower-cased section name (without the `%` sigil).
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "help" => Self::Help,
            "setup" => Self::Setup,
            "files" => Self::Files,
            "labels" => Self::Labels,
            "environment" => Self::Environment,
            "pre" => Self::Pre,
            "post" => Self::Post,
            "runscript" => Self::Runscript,
            "test" => Self::Test,
            "startscript" => Self::Startscript,
            other => {
                return AppSectionKind::ALL
                    .into_iter()
                    .find(|k| k.section_name() == other)
                    .map(Self::App)
            }
        };
        Some(kind)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Help => "help",
            Self::Setup => "setup",
            Self::Files => "files",
            Self::Labels => "labels",
            Self::Environment => "environment",
            Self::Pre => "pre",
            Self::Post => "post",
            Self::Runscript => "runscript",
            Self::Test => "test",
            Self::Startscript => "startscript",
            Self::App(kind) => kind.section_name(),
        }
    }
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// App names end up as shell variable suffixes (`SCIF_APPRUN_<name>`).
pub fn is_valid_app_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// A line opens a section when its first token is `%` followed by a name.
pub(crate) fn section_header(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim();
    let rest = trimmed.strip_prefix('%')?;
    let (name, args) = match rest.find(char::is_whitespace) {
        Some(idx) => (&rest[..idx], rest[idx..].trim()),
        None => (rest, ""),
    };
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }
    Some((name, args))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_top_level_and_app_sections() {
        assert_eq!(SectionKind::from_name("post"), Some(SectionKind::Post));
        assert_eq!(
            SectionKind::from_name("apprun"),
            Some(SectionKind::App(AppSectionKind::Run))
        );
        assert_eq!(
            SectionKind::from_name("appstart"),
            Some(SectionKind::App(AppSectionKind::Start))
        );
        assert_eq!(SectionKind::from_name("postinstall"), None);
    }

    #[test]
    fn names_roundtrip_through_lookup() {
        for kind in AppSectionKind::ALL {
            let section = SectionKind::App(kind);
            assert_eq!(SectionKind::from_name(section.name()), Some(section));
        }
    }

    #[test]
    fn section_header_splits_name_and_args() {
        assert_eq!(section_header("%post"), Some(("post", "")));
        assert_eq!(
            section_header("  %files from build  "),
            Some(("files", "from build"))
        );
        assert_eq!(section_header("%appinstall\tfoo"), Some(("appinstall", "foo")));
    }

    #[test]
    fn section_header_ignores_non_sections() {
        assert_eq!(section_header("printf '%s\\n' x"), None);
        assert_eq!(section_header("%"), None);
        assert_eq!(section_header("%{version}"), None);
        assert_eq!(section_header("echo %post"), None);
    }

    #[test]
    fn app_names_are_shell_safe() {
        assert!(is_valid_app_name("foo_2"));
        assert!(!is_valid_app_name("foo-bar"));
        assert!(!is_valid_app_name(""));
    }

    #[test]
    fn header_allow_list() {
        assert!(is_header_key("bootstrap"));
        assert!(is_header_key("stage"));
        assert!(!is_header_key("unknownkey"));
    }
}
