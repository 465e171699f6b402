use crate::definition::{
    parse_file_lines, parse_label_lines, Definition, DefinitionError, FilesSection, Script,
};
use crate::section::{is_header_key, is_valid_app_name, section_header, AppSectionKind, SectionKind};
use crate::types::AppName;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::mpsc;
use std::thread;

/// Upper bound on section parser threads for a single definition.
const MAX_PARSE_WORKERS: usize = 8;

/// A `%name [args]` line plus every line up to the next section or EOF.
#[derive(Debug)]
struct SectionToken<'a> {
    index: usize,
    name: &'a str,
    args: &'a str,
    body: Vec<&'a str>,
}

#[derive(Debug)]
enum ParsedSection {
    Script {
        kind: SectionKind,
        args: String,
        body: String,
    },
    Files(FilesSection),
    Labels(BTreeMap<String, String>),
    App {
        kind: AppSectionKind,
        app: AppName,
        body: String,
    },
    Custom {
        name: String,
        body: String,
    },
}

pub fn parse_definition_file(path: impl AsRef<Path>) -> Result<Vec<Definition>, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_all(&content)
}

/// Parse a single definition (one header block plus its sections).
pub fn parse_definition(input: &str) -> Result<Definition, DefinitionError> {
    let (header_lines, tokens) = scan(input);
    let header = parse_header(&header_lines)?;
    if header.is_empty() && tokens.is_empty() {
        return Err(DefinitionError::Empty);
    }

    let mut def = Definition {
        header,
        raw: input.as_bytes().to_vec(),
        ..Definition::default()
    };

    let mut invalid = Vec::new();
    for section in parse_sections(&tokens)? {
        apply_section(&mut def, section, &mut invalid);
    }

    if invalid.is_empty() {
        Ok(def)
    } else {
        Err(DefinitionError::InvalidSections {
            sections: invalid,
            definition: Box::new(def),
        })
    }
}

/// Parse a file that may hold several stages. A new stage starts at every
/// `Bootstrap:` line that opens a header block.
pub fn parse_all(input: &str) -> Result<Vec<Definition>, DefinitionError> {
    split_stages(input)
        .into_iter()
        .map(parse_definition)
        .collect()
}

fn split_stages(input: &str) -> Vec<&str> {
    let lines: Vec<&str> = input.split_inclusive('\n').collect();
    let mut starts = Vec::new();
    let mut offset = 0;
    let mut in_section = false;
    for (i, line) in lines.iter().enumerate() {
        if section_header(line.trim_end()).is_some() {
            in_section = true;
        } else if is_bootstrap_line(line) && (!in_section || opens_header(&lines[i..])) {
            starts.push(offset);
            in_section = false;
        }
        offset += line.len();
    }
    if starts.len() <= 1 {
        return vec![input];
    }
    // Comments ahead of the first bootstrap line belong to the first stage.
    starts[0] = 0;
    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| {
            let end = starts.get(i + 1).copied().unwrap_or(input.len());
            &input[start..end]
        })
        .collect()
}

fn is_bootstrap_line(line: &str) -> bool {
    line.trim_start()
        .get(..10)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("bootstrap:"))
}

/// Whether `lines`, starting at a `Bootstrap:` line inside a section body,
/// read as a header block: a single-word bootstrap value followed only by
/// header lines, blanks and comments up to the next section or EOF.
fn opens_header(lines: &[&str]) -> bool {
    let Some((first, rest)) = lines.split_first() else {
        return false;
    };
    let value = header_content(first)
        .split_once(':')
        .map_or("", |(_, v)| v.trim());
    if value.is_empty() || value.contains(char::is_whitespace) {
        return false;
    }
    for line in rest {
        if section_header(line.trim_end()).is_some() {
            return true;
        }
        let content = header_content(line);
        if content.is_empty() {
            continue;
        }
        match content.split_once(':') {
            Some((key, _)) if is_header_key(&key.trim().to_lowercase()) => {}
            _ => return false,
        }
    }
    true
}

fn header_content(line: &str) -> &str {
    line.find('#').map_or(line, |idx| &line[..idx]).trim()
}

fn scan(input: &str) -> (Vec<(usize, &str)>, Vec<SectionToken<'_>>) {
    let mut header = Vec::new();
    let mut tokens: Vec<SectionToken<'_>> = Vec::new();

    for (idx, line) in input.lines().enumerate() {
        if let Some((name, args)) = section_header(line) {
            tokens.push(SectionToken {
                index: tokens.len(),
                name,
                args,
                body: Vec::new(),
            });
        } else if let Some(current) = tokens.last_mut() {
            current.body.push(line);
        } else {
            header.push((idx + 1, line));
        }
    }

    (header, tokens)
}

fn parse_header(lines: &[(usize, &str)]) -> Result<BTreeMap<String, String>, DefinitionError> {
    let mut header = BTreeMap::new();
    for &(line_no, line) in lines {
        let content = header_content(line);
        if content.is_empty() {
            continue;
        }
        let Some((key, value)) = content.split_once(':') else {
            return Err(DefinitionError::MalformedHeader {
                line: line_no,
                text: content.to_owned(),
            });
        };
        let key = key.trim().to_lowercase();
        if !is_header_key(&key) {
            return Err(DefinitionError::UnknownHeaderKey(key));
        }
        header.insert(key, value.trim().to_owned());
    }
    Ok(header)
}

/// Parse section tokens on a bounded set of worker threads.
///
/// Workers only send results; the calling thread is the single owner of the
/// result map and reads it back once every worker has finished.
fn parse_sections(tokens: &[SectionToken<'_>]) -> Result<Vec<ParsedSection>, DefinitionError> {
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    let workers = thread::available_parallelism()
        .map_or(1, NonZeroUsize::get)
        .min(MAX_PARSE_WORKERS)
        .min(tokens.len());
    let batch_size = tokens.len().div_ceil(workers);

    let results = thread::scope(|scope| {
        let (tx, rx) = mpsc::channel();
        for batch in tokens.chunks(batch_size) {
            let tx = tx.clone();
            scope.spawn(move || {
                for token in batch {
                    // The receiver lives until every sender is dropped.
                    let _ = tx.send((token.index, parse_token(token)));
                }
            });
        }
        drop(tx);

        let mut results = BTreeMap::new();
        for (index, parsed) in rx {
            results.insert(index, parsed);
        }
        results
    });

    results.into_values().collect()
}

fn parse_token(token: &SectionToken<'_>) -> Result<ParsedSection, DefinitionError> {
    let name = token.name.to_ascii_lowercase();
    let body = token.body.join("\n").trim_end().to_owned();

    let parsed = match SectionKind::from_name(&name) {
        Some(SectionKind::Files) => ParsedSection::Files(FilesSection {
            args: token.args.to_owned(),
            files: parse_file_lines(&body),
        }),
        Some(SectionKind::Labels) => ParsedSection::Labels(parse_label_lines(&body)),
        Some(SectionKind::App(kind)) => {
            let app = token
                .args
                .split_whitespace()
                .next()
                .ok_or_else(|| DefinitionError::MissingAppName(name.clone()))?;
            if !is_valid_app_name(app) {
                return Err(DefinitionError::InvalidAppName {
                    section: name,
                    name: app.to_owned(),
                });
            }
            ParsedSection::App {
                kind,
                app: AppName::new(app),
                body,
            }
        }
        Some(kind) => ParsedSection::Script {
            kind,
            args: token.args.to_owned(),
            body,
        },
        None => ParsedSection::Custom { name, body },
    };
    Ok(parsed)
}

fn script_slot(def: &mut Definition, kind: SectionKind) -> Option<&mut Script> {
    let image = &mut def.image_data.scripts;
    let build = &mut def.build_data.scripts;
    match kind {
        SectionKind::Help => Some(&mut image.help),
        SectionKind::Environment => Some(&mut image.environment),
        SectionKind::Runscript => Some(&mut image.runscript),
        SectionKind::Startscript => Some(&mut image.startscript),
        SectionKind::Test => Some(&mut image.test),
        SectionKind::Pre => Some(&mut build.pre),
        SectionKind::Setup => Some(&mut build.setup),
        SectionKind::Post => Some(&mut build.post),
        SectionKind::Files | SectionKind::Labels | SectionKind::App(_) => None,
    }
}

fn apply_section(def: &mut Definition, section: ParsedSection, invalid: &mut Vec<String>) {
    match section {
        ParsedSection::Script { kind, args, body } => {
            if kind == SectionKind::Test {
                def.build_data.scripts.test.append(&args, &body);
            }
            if let Some(slot) = script_slot(def, kind) {
                slot.append(&args, &body);
            }
        }
        ParsedSection::Files(group) => def.build_data.files.push(group),
        ParsedSection::Labels(labels) => def.image_data.labels.extend(labels),
        ParsedSection::App { kind, app, body } => def.push_app_section(kind, &app, &body),
        ParsedSection::Custom { name, body } => {
            def.custom_data
                .entry(name.clone())
                .and_modify(|existing| {
                    existing.push('\n');
                    existing.push_str(&body);
                })
                .or_insert(body);
            if !invalid.contains(&name) {
                invalid.push(name);
            }
        }
    }
}
