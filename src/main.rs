// Copyright 2025 Jayashankar
// SPDX-License-Identifier: Apache-2.0

use certkeeper::{
    Config, Decision, Engine, Error, ExecutionReport, Job, Layer, Preview, Resolved, Result,
};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Exit status for input that failed validation.
const EXIT_INVALID_INPUT: i32 = 2;

// ============================================================================
// CLI definitions
// ============================================================================

#[derive(Parser)]
#[command(name = "certkeeper")]
#[command(about = "Keep TLS keys, CSRs and self-signed certificates in place")]
#[command(version)]
#[command(after_help = "\
EXAMPLES:
    certkeeper apply host.example.edu            # Create or refresh one certificate
    certkeeper apply --all                       # Every [certificates] entry, in parallel
    certkeeper plan host.example.edu             # Show what apply would do
    certkeeper apply host.example.edu --alt-name www.example.edu")]
struct Cli {
    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Show more detail (repeat for debug logging)
    #[arg(short, long, global = true, action = ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,

    /// Config file (default: $CERTKEEPER_CONFIG or the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create missing artifacts and refresh the CSR when the subject changed
    Apply {
        /// Common names to process
        #[arg(required_unless_present = "all")]
        names: Vec<String>,

        /// Process every certificate listed in the config file
        #[arg(long, conflicts_with = "names")]
        all: bool,

        #[command(flatten)]
        overrides: OverrideArgs,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show what apply would do without changing anything
    Plan {
        /// Common name
        name: String,

        #[command(flatten)]
        overrides: OverrideArgs,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the artifact paths for a certificate
    Paths {
        /// Common name
        name: String,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Check the resolved subject fields without touching anything
    Validate {
        /// Common name
        name: String,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Command-line values, taking precedence over the config file.
#[derive(Args, Clone, Default)]
struct OverrideArgs {
    /// Additional DNS name (repeatable or comma-separated)
    #[arg(long = "alt-name", value_delimiter = ',')]
    alt_names: Option<Vec<String>>,

    /// Two-letter country code
    #[arg(long)]
    country: Option<String>,

    /// State or province
    #[arg(long)]
    state: Option<String>,

    /// City or locality
    #[arg(long)]
    city: Option<String>,

    /// Organization
    #[arg(long)]
    org: Option<String>,

    /// Organizational unit
    #[arg(long)]
    org_unit: Option<String>,

    /// Directory for private keys
    #[arg(long)]
    key_dir: Option<PathBuf>,

    /// Directory for certificates (metadata goes in its meta/ subdirectory)
    #[arg(long)]
    cert_dir: Option<PathBuf>,

    /// Directory for key+certificate bundles
    #[arg(long)]
    bundle_dir: Option<PathBuf>,

    /// RSA key size for new keys
    #[arg(long)]
    key_bits: Option<u32>,

    /// Validity of new self-signed certificates in days
    #[arg(long)]
    days: Option<u32>,

    /// Owner of key and bundle ("" leaves ownership alone)
    #[arg(long)]
    owner: Option<String>,

    /// Group of key and bundle ("" leaves ownership alone)
    #[arg(long)]
    group: Option<String>,
}

impl From<OverrideArgs> for Layer {
    fn from(args: OverrideArgs) -> Self {
        Layer {
            country: args.country,
            state: args.state,
            city: args.city,
            org: args.org,
            org_unit: args.org_unit,
            alt_names: args.alt_names,
            key_dir: args.key_dir,
            cert_dir: args.cert_dir,
            bundle_dir: args.bundle_dir,
            key_bits: args.key_bits,
            days: args.days,
            owner: args.owner,
            group: args.group,
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Output helper that respects --quiet and --verbose flags.
#[derive(Clone, Copy)]
struct Output {
    quiet: bool,
    verbose: bool,
}

impl Output {
    fn new(quiet: bool, verbose: bool) -> Self {
        Self { quiet, verbose }
    }

    /// Print a standard message (suppressed with --quiet)
    fn print(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    /// Print a verbose message (only shown with --verbose)
    fn verbose(&self, msg: &str) {
        if self.verbose {
            println!("{}", msg);
        }
    }
}

fn init_logging(quiet: bool, verbose: u8) {
    let default = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, _) => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| Error::Config(format!("Failed to serialize output: {}", e)))?;
    println!("{}", text);
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let path = Config::locate(path)?;
    tracing::debug!(path = %path.display(), "loading config");
    Config::load(&path)
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_apply(
    config: &Config,
    names: Vec<String>,
    all: bool,
    overrides: Layer,
    json: bool,
    out: Output,
) -> Result<i32> {
    let names = if all {
        let names = config.certificate_names();
        if names.is_empty() {
            return Err(Error::Config(
                "--all given but the config file lists no [certificates]".into(),
            ));
        }
        names
    } else {
        names
    };

    // Resolve everything up front so a config mistake stops the whole batch.
    let jobs = names
        .iter()
        .map(|name| {
            config
                .resolve(name, overrides.clone())
                .map(|Resolved { input, settings }| Job { input, settings })
        })
        .collect::<Result<Vec<_>>>()?;

    let engine = Engine::openssl(&config.runtime);
    let results = if jobs.len() == 1 {
        jobs.into_iter()
            .map(|job| {
                let name = job.input.common_name.clone();
                (name, engine.apply(job.input, &job.settings))
            })
            .collect()
    } else {
        engine.apply_many(jobs)
    };

    let mut exit = 0;
    let mut reports: Vec<&ExecutionReport> = Vec::new();
    for (name, result) in &results {
        match result {
            Ok(report) => {
                if !report.is_success() {
                    exit = exit.max(1);
                }
                reports.push(report);
            }
            Err(e) => {
                eprintln!("Error: {}: {}", name, e);
                let code = if e.is_validation() {
                    EXIT_INVALID_INPUT
                } else {
                    1
                };
                exit = exit.max(code);
            }
        }
    }

    if json {
        print_json(&reports)?;
    } else {
        for report in reports {
            if report.is_success() && report.changed().is_empty() {
                out.print(&format!("{}: up to date", report.common_name));
                out.verbose(&report.to_string());
            } else if report.is_success() {
                out.print(&report.to_string());
            } else {
                // Failures are shown even with --quiet.
                println!("{}", report);
            }
        }
    }

    Ok(exit)
}

fn print_preview(preview: &Preview, out: Output) {
    out.print(&format!("{}:", preview.common_name));
    for planned in &preview.steps {
        let what = match planned.decision {
            Decision::Run => "run".to_string(),
            Decision::Skip(reason) => format!("skip ({})", reason),
        };
        out.print(&format!("  {:<20} {}", planned.step.name(), what));
    }
    out.verbose(&format!(
        "  config {}",
        if preview.config_changes {
            "would change"
        } else {
            "unchanged"
        }
    ));
}

fn cmd_plan(config: &Config, name: &str, overrides: Layer, json: bool, out: Output) -> Result<()> {
    let resolved = config.resolve(name, overrides)?;
    let engine = Engine::openssl(&config.runtime);
    let preview = engine.preview(resolved.input, &resolved.settings)?;

    if json {
        print_json(&preview)
    } else {
        print_preview(&preview, out);
        Ok(())
    }
}

fn cmd_paths(config: &Config, name: &str, overrides: Layer) -> Result<()> {
    let resolved = config.resolve(name, overrides)?;
    let engine = Engine::openssl(&config.runtime);
    let artifacts = engine.plan(resolved.input, &resolved.settings)?;

    println!("key          {}", artifacts.key.display());
    println!("config       {}", artifacts.config.display());
    println!("csr          {}", artifacts.csr.display());
    println!("csr-text     {}", artifacts.csr_text.display());
    println!("certificate  {}", artifacts.certificate.display());
    println!("bundle       {}", artifacts.bundle.display());
    Ok(())
}

fn cmd_validate(config: &Config, name: &str, overrides: Layer, out: Output) -> Result<()> {
    let resolved = config.resolve(name, overrides)?;
    let identity = certkeeper::validate(resolved.input)?;
    out.print(&format!("{}: valid", identity.common_name()));
    out.verbose(&format!("  alt names: {}", identity.alt_names().join(", ")));
    Ok(())
}

fn main() {
    // Reset SIGPIPE to default behavior (exit) instead of panic
    // when output is piped to tools like head
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            let code = if e.is_validation() {
                EXIT_INVALID_INPUT
            } else {
                1
            };
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);
    let out = Output::new(cli.quiet, cli.verbose > 0);

    if let Commands::Completions { shell } = cli.command {
        generate(shell, &mut Cli::command(), "certkeeper", &mut io::stdout());
        return Ok(0);
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Apply {
            names,
            all,
            overrides,
            json,
        } => cmd_apply(&config, names, all, overrides.into(), json, out),
        Commands::Plan {
            name,
            overrides,
            json,
        } => cmd_plan(&config, &name, overrides.into(), json, out).map(|()| 0),
        Commands::Paths { name, overrides } => {
            cmd_paths(&config, &name, overrides.into()).map(|()| 0)
        }
        Commands::Validate { name, overrides } => {
            cmd_validate(&config, &name, overrides.into(), out).map(|()| 0)
        }
        Commands::Completions { .. } => Ok(0),
    }
}
