use crate::CoreError;
use kiln_bundle::{write_atomic, Bundle, BundleLayout};
use kiln_schema::Script;
use std::collections::BTreeMap;
use std::fs;
use tracing::{debug, info, warn};

const LABEL_SCHEMA: &str = "org.label-schema";
const ENVIRONMENT_HEADER: &str = "#!/bin/sh\n# Custom environment shell code should follow\n\n";
const DEFAULT_SHEBANG: &str = "#!/bin/sh";

/// Write the image metadata directory from the bundle's recipe.
///
/// Each writer is idempotent; the order is help, labels, definition,
/// environment, runscript, startscript, test.
pub fn insert_metadata(bundle: &Bundle) -> Result<(), CoreError> {
    let layout = bundle.layout();
    fs::create_dir_all(layout.env_dir())?;
    insert_help(bundle, layout)?;
    insert_labels(bundle, layout)?;
    insert_definition(bundle, layout)?;
    insert_environment(bundle, layout)?;
    insert_script(bundle, "runscript", &bundle.recipe.image_data.scripts.runscript, &layout.runscript())?;
    insert_script(bundle, "startscript", &bundle.recipe.image_data.scripts.startscript, &layout.startscript())?;
    insert_script(bundle, "test", &bundle.recipe.image_data.scripts.test, &layout.test_script())?;
    Ok(())
}

fn insert_help(bundle: &Bundle, layout: &BundleLayout) -> Result<(), CoreError> {
    let help = &bundle.recipe.image_data.scripts.help;
    if !bundle.run_section("help") || help.is_empty() {
        return Ok(());
    }
    debug!("writing {}", layout.runscript_help().display());
    write_atomic(&layout.runscript_help(), format!("{}\n", help.script).as_bytes(), 0o644)?;
    Ok(())
}

/// Fold `incoming` into `existing`.
///
/// A key already present with a different value is a collision: it is
/// overwritten only with `force`, otherwise kept and reported. Returns the
/// colliding keys.
pub fn merge_labels(
    existing: &mut BTreeMap<String, String>,
    incoming: &BTreeMap<String, String>,
    force: bool,
) -> Vec<String> {
    let mut collisions = Vec::new();
    for (key, value) in incoming {
        match existing.get(key) {
            Some(old) if old == value => {}
            Some(old) => {
                if force {
                    debug!("label {key}: overwriting '{old}' with '{value}'");
                    existing.insert(key.clone(), value.clone());
                } else {
                    warn!("label {key} already exists with value '{old}', use force to overwrite");
                }
                collisions.push(key.clone());
            }
            None => {
                existing.insert(key.clone(), value.clone());
            }
        }
    }
    collisions
}

/// Labels every build stamps onto its image.
pub fn build_labels(header: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(format!("{LABEL_SCHEMA}.schema-version"), "1.0".to_owned());
    labels.insert(
        format!("{LABEL_SCHEMA}.build-date"),
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );
    labels.insert(
        format!("{LABEL_SCHEMA}.build-arch"),
        std::env::consts::ARCH.to_owned(),
    );
    labels.insert(
        format!("{LABEL_SCHEMA}.usage.kiln.version"),
        env!("CARGO_PKG_VERSION").to_owned(),
    );
    for (key, value) in header {
        labels.insert(
            format!("{LABEL_SCHEMA}.usage.singularity.deffile.{key}"),
            value.clone(),
        );
    }
    labels
}

fn insert_labels(bundle: &Bundle, layout: &BundleLayout) -> Result<(), CoreError> {
    let path = layout.labels_file();
    let mut labels: BTreeMap<String, String> = if path.is_file() {
        serde_json::from_str(&fs::read_to_string(&path)?)?
    } else {
        BTreeMap::new()
    };

    let force = bundle.opts.force;
    if bundle.run_section("labels") {
        merge_labels(&mut labels, &bundle.recipe.image_data.labels, force);
    }
    labels.extend(build_labels(&bundle.recipe.header));

    let json = serde_json::to_string_pretty(&labels)?;
    write_atomic(&path, json.as_bytes(), 0o644)?;
    Ok(())
}

fn insert_definition(bundle: &Bundle, layout: &BundleLayout) -> Result<(), CoreError> {
    let path = layout.definition_file();
    if path.is_file() {
        let history = layout.bootstrap_history_dir();
        fs::create_dir_all(&history)?;
        let index = fs::read_dir(&history)?.count();
        let rotated = history.join(format!("Singularity{index}"));
        info!("moving previous definition to {}", rotated.display());
        fs::rename(&path, &rotated)?;
    }
    write_atomic(&path, &bundle.recipe.raw, 0o644)?;
    Ok(())
}

fn insert_environment(bundle: &Bundle, layout: &BundleLayout) -> Result<(), CoreError> {
    let env = &bundle.recipe.image_data.scripts.environment;
    if !bundle.run_section("environment") || env.is_empty() {
        return Ok(());
    }
    let path = layout.environment_script();
    let content = if path.is_file() {
        let mut current = fs::read_to_string(&path)?;
        if !current.ends_with('\n') {
            current.push('\n');
        }
        format!("{current}{}\n", env.script)
    } else {
        format!("{ENVIRONMENT_HEADER}{}\n", env.script)
    };
    write_atomic(&path, content.as_bytes(), 0o755)?;
    Ok(())
}

/// Split an optional `#!` first line off the body and add the section args.
fn shebang_script(script: &Script) -> (String, String) {
    let body = script.script.as_str();
    let (mut shebang, rest) = match body.split_once('\n') {
        Some((first, rest)) if first.starts_with("#!") => (first.trim_end().to_owned(), rest),
        None if body.starts_with("#!") => (body.trim_end().to_owned(), ""),
        _ => (DEFAULT_SHEBANG.to_owned(), body),
    };
    let args = script.args_without_comment();
    if !args.is_empty() {
        shebang.push(' ');
        shebang.push_str(args);
    }
    (shebang, rest.to_owned())
}

fn insert_script(
    bundle: &Bundle,
    section: &str,
    script: &Script,
    path: &std::path::Path,
) -> Result<(), CoreError> {
    if !bundle.run_section(section) || script.is_empty() {
        return Ok(());
    }
    let (shebang, body) = shebang_script(script);
    debug!("writing {section} to {}", path.display());
    write_atomic(path, format!("{shebang}\n\n{body}\n").as_bytes(), 0o755)?;
    Ok(())
}
