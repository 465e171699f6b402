use crate::section::AppSectionKind;
use crate::types::AppName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to read definition file: {0}")]
    Io(#[from] std::io::Error),
    #[error("empty definition file")]
    Empty,
    #[error("header line {line} is not a 'key: value' pair: '{text}'")]
    MalformedHeader { line: usize, text: String },
    #[error("invalid header keyword found: {0}")]
    UnknownHeaderKey(String),
    #[error("app section '%{0}' requires an app name")]
    MissingAppName(String),
    #[error("invalid app name '{name}' in '%{section}': only [A-Za-z0-9_] allowed")]
    InvalidAppName { section: String, name: String },
    #[error("invalid section(s) specified: {}", .sections.join(", "))]
    InvalidSections {
        sections: Vec<String>,
        definition: Box<Definition>,
    },
    #[error("invalid definition JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl DefinitionError {
    /// Recover the parsed definition from an unknown-section error.
    ///
    /// Unknown sections are kept in [`Definition::custom_data`]; callers that
    /// tolerate them can continue with the returned definition.
    pub fn into_definition(self) -> Option<Definition> {
        match self {
            Self::InvalidSections { definition, .. } => Some(*definition),
            _ => None,
        }
    }
}

/// A scriptlet body plus the arguments given on its section line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub script: String,
}

impl Script {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            args: String::new(),
            script: script.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.script.trim().is_empty()
    }

    /// Interpreter selected with `-c <interp>` in the section args.
    pub fn interpreter(&self) -> Option<Vec<String>> {
        let mut words = self.args.split_whitespace();
        while let Some(word) = words.next() {
            if word == "-c" {
                let interp: Vec<String> = words
                    .take_while(|w| !w.starts_with('#'))
                    .map(str::to_owned)
                    .collect();
                return (!interp.is_empty()).then_some(interp);
            }
        }
        None
    }

    /// Section args with any trailing `#` comment removed.
    pub fn args_without_comment(&self) -> &str {
        match self.args.find('#') {
            Some(idx) => self.args[..idx].trim(),
            None => self.args.trim(),
        }
    }

    pub(crate) fn append(&mut self, args: &str, body: &str) {
        if self.args.is_empty() {
            args.clone_into(&mut self.args);
        }
        if self.script.is_empty() {
            body.clone_into(&mut self.script);
        } else if !body.is_empty() {
            self.script.push('\n');
            self.script.push_str(body);
        }
    }
}

/// One `src dst` line of a `%files` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransport {
    pub src: String,
    pub dst: String,
}

/// One `%files [from <stage>]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesSection {
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub files: Vec<FileTransport>,
}

impl FilesSection {
    /// Name of the stage this group copies from, if it is a cross-stage copy.
    pub fn source_stage(&self) -> Option<&str> {
        let mut words = self.args.split_whitespace();
        match (words.next(), words.next()) {
            (Some(from), Some(stage)) if from.eq_ignore_ascii_case("from") => Some(stage),
            _ => None,
        }
    }
}

/// Scripts shipped inside the finished image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageScripts {
    #[serde(default)]
    pub help: Script,
    #[serde(default)]
    pub environment: Script,
    #[serde(default)]
    pub runscript: Script,
    #[serde(default)]
    pub test: Script,
    #[serde(default)]
    pub startscript: Script,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageData {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub scripts: ImageScripts,
}

/// Scripts executed while the image is being built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildScripts {
    #[serde(default)]
    pub pre: Script,
    #[serde(default)]
    pub setup: Script,
    #[serde(default)]
    pub post: Script,
    #[serde(default)]
    pub test: Script,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildData {
    #[serde(default)]
    pub files: Vec<FilesSection>,
    #[serde(default)]
    pub scripts: BuildScripts,
}

/// The raw body of an app-scoped section, e.g. `%apprun foo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSection {
    pub kind: AppSectionKind,
    pub app: AppName,
    #[serde(default)]
    pub body: String,
}

/// A parsed definition file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    #[serde(default)]
    pub header: BTreeMap<String, String>,
    #[serde(default)]
    pub image_data: ImageData,
    #[serde(default)]
    pub build_data: BuildData,
    #[serde(default)]
    pub app_sections: Vec<AppSection>,
    /// App names in order of first appearance.
    #[serde(default)]
    pub app_order: Vec<AppName>,
    /// Bodies of sections the parser does not recognize, keyed by name.
    #[serde(default)]
    pub custom_data: BTreeMap<String, String>,
    #[serde(default)]
    pub raw: Vec<u8>,
}

impl Definition {
    pub fn bootstrap(&self) -> Option<&str> {
        self.header.get("bootstrap").map(String::as_str)
    }

    pub fn stage_name(&self) -> Option<&str> {
        self.header
            .get("stage")
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn has_content(&self) -> bool {
        !self.header.is_empty() || self.section_count() > 0
    }

    fn section_count(&self) -> usize {
        let s = &self.image_data.scripts;
        let b = &self.build_data.scripts;
        [
            &s.help,
            &s.environment,
            &s.runscript,
            &s.test,
            &s.startscript,
            &b.pre,
            &b.setup,
            &b.post,
        ]
        .iter()
        .filter(|sc| !sc.is_empty())
        .count()
            + usize::from(!self.image_data.labels.is_empty())
            + self.build_data.files.len()
            + self.app_sections.len()
            + self.custom_data.len()
    }

    /// Find the body of an app section, if declared.
    pub fn app_section(&self, app: &str, kind: AppSectionKind) -> Option<&str> {
        self.app_sections
            .iter()
            .find(|s| s.kind == kind && s.app == *app)
            .map(|s| s.body.as_str())
    }

    pub(crate) fn push_app_section(&mut self, kind: AppSectionKind, app: &AppName, body: &str) {
        if !self.app_order.contains(app) {
            self.app_order.push(app.clone());
        }
        if let Some(existing) = self
            .app_sections
            .iter_mut()
            .find(|s| s.kind == kind && s.app == *app)
        {
            if !body.is_empty() {
                if !existing.body.is_empty() {
                    existing.body.push('\n');
                }
                existing.body.push_str(body);
            }
            return;
        }
        self.app_sections.push(AppSection {
            kind,
            app: app.clone(),
            body: body.to_owned(),
        });
    }

    pub fn to_json(&self) -> Result<String, DefinitionError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(input: &str) -> Result<Self, DefinitionError> {
        Ok(serde_json::from_str(input)?)
    }
}

/// Split `key value` lines (labels) into a map. Value defaults to empty.
pub fn parse_label_lines(body: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    for (key, value) in split_pairs(body) {
        labels.insert(key.to_owned(), value.to_owned());
    }
    labels
}

/// Split `src [dst]` lines of a files section. `dst` defaults to `src`.
pub fn parse_file_lines(body: &str) -> Vec<FileTransport> {
    split_pairs(body)
        .map(|(src, dst)| FileTransport {
            src: src.to_owned(),
            dst: if dst.is_empty() { src } else { dst }.to_owned(),
        })
        .collect()
}

fn split_pairs(body: &str) -> impl Iterator<Item = (&str, &str)> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|line| match line.find(char::is_whitespace) {
            Some(idx) => (&line[..idx], line[idx..].trim()),
            None => (line, ""),
        })
}
