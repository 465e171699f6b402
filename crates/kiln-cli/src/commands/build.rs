use super::{core_error_message, json_pretty, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use kiln_bundle::{EncryptionKey, Options};
use kiln_core::{Build, BuildConfig, BuildRequest};
use kiln_runtime::{check_assembler_prereqs, check_build_prereqs, format_missing, ImageFormat};
use kiln_schema::{parse_definition_file, Definition};
use std::path::PathBuf;

#[derive(Debug, Default)]
pub struct BuildArgs {
    pub dest: PathBuf,
    pub definition: PathBuf,
    pub sandbox: bool,
    pub format: Option<String>,
    pub sections: Vec<String>,
    pub force: bool,
    pub update: bool,
    pub notest: bool,
    pub tmpdir: Option<PathBuf>,
    pub no_cleanup: bool,
    pub no_https: bool,
    pub disable_cache: bool,
    pub allow_env: Vec<String>,
    pub passphrase: bool,
    pub pem_path: Option<PathBuf>,
    pub json: bool,
}

pub fn run(args: &BuildArgs) -> Result<u8, String> {
    let config = BuildConfig::load_default()
        .map_err(|e| core_error_message(&e))?
        .with_env(|k| std::env::var(k).ok());

    let definitions = parse_definition_file(&args.definition).map_err(|e| {
        format!("definition error: {}: {e}", args.definition.display())
    })?;
    tracing::debug!(
        "{} defines {} stage(s)",
        args.definition.display(),
        definitions.len()
    );
    let format = select_format(args, &config)?;
    let opts = build_options(args, &config)?;

    if std::env::var("KILN_SKIP_PREREQS").as_deref() != Ok("1") {
        check_prereqs(&definitions, format)?;
    }

    let files_root = std::env::current_dir()
        .map_err(|e| format!("cannot determine working directory: {e}"))?;
    let request = BuildRequest {
        definitions,
        dest: args.dest.clone(),
        format,
        opts,
        tmp_dir: args.tmpdir.clone().unwrap_or_else(|| config.tmp_dir()),
        files_root,
    };
    let build = Build::new(request).map_err(|e| core_error_message(&e))?;

    let pb = if args.json {
        None
    } else {
        Some(spinner(&format!("building {}...", args.dest.display())))
    };
    let summary = match build.full() {
        Ok(summary) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "image built");
            }
            summary
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "build failed");
            }
            return Err(core_error_message(&e));
        }
    };

    if args.json {
        println!("{}", json_pretty(&summary)?);
    } else {
        println!(
            "built {} image {} ({} stage{})",
            summary.format,
            summary.destination.display(),
            summary.stages.len(),
            if summary.stages.len() == 1 { "" } else { "s" }
        );
        for kept in &summary.kept_bundles {
            println!("kept build directory {}", kept.display());
        }
    }
    Ok(EXIT_SUCCESS)
}

fn select_format(args: &BuildArgs, config: &BuildConfig) -> Result<ImageFormat, String> {
    if args.sandbox {
        return Ok(ImageFormat::Sandbox);
    }
    let named = args.format.as_deref().or(config.default_format.as_deref());
    match named {
        Some(name) => {
            ImageFormat::from_name(name).map_err(|e| format!("validation error: {e}"))
        }
        None if args.update => Ok(ImageFormat::Sandbox),
        None => Ok(ImageFormat::for_destination(&args.dest)),
    }
}

fn build_options(args: &BuildArgs, config: &BuildConfig) -> Result<Options, String> {
    let sections = if !args.sections.is_empty() {
        args.sections.clone()
    } else if let Some(sections) = &config.sections {
        sections.clone()
    } else {
        vec!["all".to_owned()]
    };

    let mut allowed_env = config.allowed_env.clone();
    for name in &args.allow_env {
        if !allowed_env.contains(name) {
            allowed_env.push(name.clone());
        }
    }

    let encryption_key = if args.passphrase {
        let pass = std::env::var("KILN_ENCRYPTION_PASSPHRASE").map_err(|_| {
            "validation error: --passphrase needs KILN_ENCRYPTION_PASSPHRASE to be set".to_owned()
        })?;
        Some(EncryptionKey::Passphrase(pass))
    } else {
        args.pem_path.clone().map(EncryptionKey::PemFile)
    };

    Ok(Options {
        sections,
        image_cache: if args.disable_cache {
            None
        } else {
            config.cache_dir()
        },
        no_cleanup: args.no_cleanup || config.no_cleanup,
        force: args.force,
        update: args.update,
        no_test: args.notest,
        no_https: args.no_https,
        allowed_env,
        encryption_key,
    })
}

fn check_prereqs(definitions: &[Definition], format: ImageFormat) -> Result<(), String> {
    let mut missing = Vec::new();
    for def in definitions {
        for m in check_build_prereqs(def.bootstrap().unwrap_or_default()) {
            if !missing.contains(&m) {
                missing.push(m);
            }
        }
    }
    for m in check_assembler_prereqs(format) {
        if !missing.contains(&m) {
            missing.push(m);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format_missing(&missing))
    }
}
