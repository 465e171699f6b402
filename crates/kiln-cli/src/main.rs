mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_DEFINITION_ERROR, EXIT_FAILURE, EXIT_VALIDATION_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    version,
    about = "Build container images from definition files"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build an image from a definition file.
    Build {
        /// Destination image path (file, or directory with --sandbox).
        dest: PathBuf,
        /// Definition file.
        definition: PathBuf,
        /// Write a sandbox directory instead of an image file.
        #[arg(short, long, default_value_t = false)]
        sandbox: bool,
        /// Output format: sandbox, tar, or squashfs.
        #[arg(long, conflicts_with = "sandbox")]
        format: Option<String>,
        /// Only run these sections (all, none, or section names).
        #[arg(long = "section", value_delimiter = ',')]
        sections: Vec<String>,
        /// Overwrite an existing destination and colliding labels.
        #[arg(short, long, default_value_t = false)]
        force: bool,
        /// Build on top of an existing sandbox destination.
        #[arg(short, long, default_value_t = false)]
        update: bool,
        /// Skip the %test section.
        #[arg(short = 'T', long, default_value_t = false)]
        notest: bool,
        /// Directory for temporary build trees.
        #[arg(long)]
        tmpdir: Option<PathBuf>,
        /// Keep temporary build trees after the build.
        #[arg(long, default_value_t = false)]
        no_cleanup: bool,
        /// Allow plain-http downloads.
        #[arg(long, default_value_t = false)]
        no_https: bool,
        /// Do not use the image cache.
        #[arg(long, default_value_t = false)]
        disable_cache: bool,
        /// Host environment variable passed into build scripts (repeatable).
        #[arg(long = "allow-env")]
        allow_env: Vec<String>,
        /// Encrypt with the passphrase in KILN_ENCRYPTION_PASSPHRASE.
        #[arg(long, default_value_t = false)]
        passphrase: bool,
        /// Encrypt with an RSA public key in PEM format.
        #[arg(long, conflicts_with = "passphrase")]
        pem_path: Option<PathBuf>,
    },
    /// Parse a definition file and print its JSON form.
    Parse {
        /// Definition file (or JSON with --from-json).
        definition: PathBuf,
        /// Print definition-file text instead of JSON.
        #[arg(long, default_value_t = false)]
        serialize: bool,
        /// Read the JSON form instead of definition text.
        #[arg(long, default_value_t = false)]
        from_json: bool,
    },
    /// Check host tools and build directories.
    Doctor {
        /// Also check the tools this bootstrap needs.
        #[arg(long)]
        bootstrap: Option<String>,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("KILN_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let json_output = cli.json;
    let result = match cli.command {
        Commands::Build {
            dest,
            definition,
            sandbox,
            format,
            sections,
            force,
            update,
            notest,
            tmpdir,
            no_cleanup,
            no_https,
            disable_cache,
            allow_env,
            passphrase,
            pem_path,
        } => commands::build::run(&commands::build::BuildArgs {
            dest,
            definition,
            sandbox,
            format,
            sections,
            force,
            update,
            notest,
            tmpdir,
            no_cleanup,
            no_https,
            disable_cache,
            allow_env,
            passphrase,
            pem_path,
            json: json_output,
        }),
        Commands::Parse {
            definition,
            serialize,
            from_json,
        } => commands::parse::run(&definition, serialize, from_json),
        Commands::Doctor { bootstrap } => commands::doctor::run(bootstrap.as_deref(), json_output),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("definition error:") {
                EXIT_DEFINITION_ERROR
            } else if msg.starts_with("validation error:") {
                EXIT_VALIDATION_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
