//! sideload - Injects dylibs, frameworks and resource bundles into installed
//! app packages.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sideload::config::Ownership;
use sideload::{canonical_name, Injector, InjectorConfig, MachOFile};

/// Injects dylibs, frameworks and resource bundles into installed app packages.
#[derive(Parser, Debug)]
#[command(name = "sideload")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inject assets into an app package
    Inject {
        /// App package (the .app directory)
        package: PathBuf,

        /// Assets to inject (.dylib, .framework, .bundle)
        #[arg(required = true)]
        assets: Vec<PathBuf>,

        #[command(flatten)]
        target: TargetArgs,

        /// Team identifier passed to the bypass program
        #[arg(short, long)]
        team_id: Option<String>,

        /// Signature bypass program
        #[arg(short, long)]
        bypass_tool: Option<PathBuf>,

        /// Insert strong (LC_LOAD_DYLIB) instead of weak dependencies
        #[arg(long)]
        strong: bool,

        /// Keep file ownership instead of handing files to the installer
        #[arg(long)]
        preserve_owner: bool,

        /// Record injected assets in a receipt inside the package
        #[arg(long)]
        persist: bool,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,
    },

    /// List the dependencies of a Mach-O file
    Deps {
        /// Mach-O file
        binary: PathBuf,

        /// Also show runtime search paths and header flags
        #[arg(short, long)]
        long: bool,
    },

    /// Print the canonical install name of assets
    Name {
        /// Assets (.dylib or .framework)
        #[arg(required = true)]
        assets: Vec<PathBuf>,
    },

    /// Restore the target from a snapshot left by an interrupted run
    Recover {
        /// App package (the .app directory)
        package: PathBuf,

        #[command(flatten)]
        target: TargetArgs,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,
    },
}

/// Options selecting the configuration and target executable.
#[derive(clap::Args, Debug)]
struct TargetArgs {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Target executable, relative to the package's Frameworks directory
    #[arg(long)]
    target: Option<PathBuf>,
}

impl TargetArgs {
    fn load(&self) -> Result<InjectorConfig> {
        let mut config = match &self.config {
            Some(path) => InjectorConfig::load(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => InjectorConfig::default(),
        };
        if let Some(target) = &self.target {
            config = config.with_target(target);
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Inject {
            package,
            assets,
            target,
            team_id,
            bypass_tool,
            strong,
            preserve_owner,
            persist,
            verbosity,
        } => {
            setup_logging(verbosity);

            let mut config = target.load()?;
            if let Some(team_id) = team_id {
                config = config.with_team_id(team_id);
            }
            if let Some(tool) = bypass_tool {
                config = config.with_bypass_program(tool);
            }
            if strong {
                config = config.with_weak(false);
            }
            if preserve_owner {
                config = config.with_ownership(Ownership::Preserve);
            }
            if persist {
                config = config.with_persist(true);
            }

            cmd_inject(&package, &assets, config, verbosity)
        }
        Commands::Deps { binary, long } => cmd_deps(&binary, long),
        Commands::Name { assets } => cmd_name(&assets),
        Commands::Recover {
            package,
            target,
            verbosity,
        } => {
            setup_logging(verbosity);
            cmd_recover(&package, target.load()?)
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn cmd_inject(
    package: &Path,
    assets: &[PathBuf],
    config: InjectorConfig,
    verbosity: u8,
) -> Result<()> {
    let start = Instant::now();

    if !package.is_dir() {
        bail!("Package is not a directory: {}", package.display());
    }
    if config.team_id.is_empty() {
        warn!("No team identifier given; the bypass program may reject the target");
    }

    let injector = Injector::new(package, config)
        .with_context(|| format!("Invalid configuration for {}", package.display()))?;

    // Log lines and a spinner would interleave
    let spinner = if verbosity <= 1 {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap(),
        );
        spinner.set_message(format!("Injecting {} asset(s)", assets.len()));
        spinner.enable_steady_tick(Duration::from_millis(100));
        Some(spinner)
    } else {
        None
    };

    let result = injector.inject(assets);
    if let Some(spinner) = &spinner {
        spinner.finish_and_clear();
    }

    let report = match result {
        Ok(report) => report,
        Err(e) if e.is_fatal_corruption() => {
            error!("{}", e.root());
            error!(
                "Run `sideload recover {}` to restore the original executable",
                package.display()
            );
            return Err(e).context("Injection failed and the target could not be restored");
        }
        Err(e) => {
            if e.requires_rollback() {
                warn!("Target restored to its original state");
            }
            return Err(e).context("Injection failed");
        }
    };

    for bundle in &report.bundles {
        println!("installed {}", bundle.display());
    }
    for name in report.install_names() {
        println!("linked    {}", name);
    }

    info!(
        "Injected {} asset(s) in {:.2}s",
        assets.len(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn cmd_deps(binary: &Path, long: bool) -> Result<()> {
    let file = MachOFile::open(binary)
        .with_context(|| format!("Failed to open Mach-O: {}", binary.display()))?;

    for (range, ctx) in file.slices().iter().zip(file.contexts()?) {
        println!("{} @ {:#x}", ctx.header, range.offset);
        if let Some(id) = ctx.install_name() {
            println!("  id     {}", id);
        }
        for dep in ctx.dependencies() {
            println!("  {:<20} {}", dep.kind.as_str(), dep.name);
        }
        if long {
            for rpath in ctx.rpaths() {
                println!("  {:<20} {}", "LC_RPATH", rpath);
            }
            println!("  flags  {:?}", ctx.header.header_flags());
            println!(
                "  space  {} bytes free for load commands",
                ctx.available_load_command_space()
            );
            if ctx.has_code_signature() {
                println!("  signed (LC_CODE_SIGNATURE)");
            }
        }
    }

    Ok(())
}

fn cmd_name(assets: &[PathBuf]) -> Result<()> {
    for asset in assets {
        let name = canonical_name(asset)
            .with_context(|| format!("Failed to resolve: {}", asset.display()))?;
        println!("{}", name);
    }
    Ok(())
}

fn cmd_recover(package: &Path, config: InjectorConfig) -> Result<()> {
    let injector = Injector::new(package, config)?;

    if injector.recover().context("Recovery failed")? {
        println!("restored {}", injector.target().display());
    } else {
        println!("nothing to recover for {}", injector.target().display());
    }
    Ok(())
}
