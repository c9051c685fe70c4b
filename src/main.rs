//! CLI entry point for setup-tool.
//!
//! Provides a command-line interface for inspecting setup trees without a
//! running control process:
//! - listing discoverable setups with their group and description
//! - validating setups (shape, includes, exclusions, device graph)
//! - showing the resolution and instantiation order for a request
//!
//! # Usage
//!
//! ```bash
//! setup-tool --root /opt/shared/setups --root /opt/facility/setups list
//! setup-tool --root setups check
//! setup-tool --root setups resolve table ccr
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use instrument_setups::{
    DeviceGraph, FactoryCatalog, LoadOptions, Resolver, Session, SetupGroup, SetupRoots,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::warn;

#[derive(Parser)]
#[command(name = "setup-tool")]
#[command(about = "Inspect and validate instrument setup trees", long_about = None)]
struct Cli {
    /// Setup search root; may be given multiple times, later roots
    /// override earlier ones by setup name
    #[arg(long = "root", required = true)]
    roots: Vec<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all discoverable setups
    List,

    /// Validate setups without constructing devices
    Check {
        /// Setups to check (all discoverable setups when omitted)
        setups: Vec<String>,
    },

    /// Show resolution and instantiation order for a request
    Resolve {
        /// Setups to resolve
        #[arg(required = true)]
        setups: Vec<String>,

        /// Permit special-group setups
        #[arg(long)]
        allow_special: bool,

        /// Also load the `system` setup when present
        #[arg(long)]
        autoload_system: bool,
    },
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let roots = SetupRoots::new(cli.roots.clone());

    let outcome = match cli.command {
        Commands::List => list(&roots),
        Commands::Check { setups } => check(&roots, &setups),
        Commands::Resolve {
            setups,
            allow_special,
            autoload_system,
        } => resolve(&roots, &setups, allow_special, autoload_system),
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn list(roots: &SetupRoots) -> Result<ExitCode> {
    for name in roots.discover()? {
        match roots.load(&name) {
            Ok(setup) => {
                println!("{:<30} {:<10} {}", name, setup.group, setup.description);
            }
            Err(err) => {
                println!("{name:<30} (unreadable: {err})");
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn check(roots: &SetupRoots, setups: &[String]) -> Result<ExitCode> {
    let names = if setups.is_empty() {
        roots.discover()?
    } else {
        setups.to_vec()
    };

    let session = Session::new(roots.clone(), FactoryCatalog::new());
    let mut problem_count = 0usize;
    let mut checked = 0usize;

    for name in &names {
        // each setup is checked on its own so that alternative setups do
        // not conflict with each other during a full sweep
        let group = match roots.load(name) {
            Ok(setup) => setup.group,
            Err(err) => {
                println!("{name}: {err}");
                problem_count += 1;
                continue;
            }
        };
        if group == SetupGroup::Configdata {
            continue;
        }
        let options = LoadOptions {
            allow_special: group == SetupGroup::Special,
            ..LoadOptions::default()
        };

        checked += 1;
        match session.check(&[name.as_str()], &options) {
            Ok(report) if report.is_clean() => {}
            Ok(report) => {
                for problem in &report.problems {
                    println!("{name}: {problem}");
                }
                problem_count += report.problems.len();
            }
            Err(err) => {
                println!("{name}: {err}");
                problem_count += 1;
            }
        }
    }

    println!("{checked} setups checked, {problem_count} problems");
    if problem_count == 0 {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn resolve(
    roots: &SetupRoots,
    setups: &[String],
    allow_special: bool,
    autoload_system: bool,
) -> Result<ExitCode> {
    let options = LoadOptions {
        allow_special,
        autoload_system,
        ..LoadOptions::default()
    };
    let resolved = Resolver::new(roots).resolve(setups, &options)?;
    let graph = DeviceGraph::build(&resolved)?;

    println!("setups ({}):", resolved.descriptors.len());
    for descriptor in &resolved.descriptors {
        println!("  {:<30} [{}]", descriptor.name, descriptor.group);
    }

    println!("devices ({}, instantiation order):", graph.len());
    for node in graph.instantiation_order() {
        let deps = graph.dependencies(&node.name);
        if deps.is_empty() {
            println!("  {:<30} {}", node.name, node.spec.class_path);
        } else {
            println!(
                "  {:<30} {}  <- {}",
                node.name,
                node.spec.class_path,
                deps.join(", ")
            );
        }
    }

    let dangling = graph.dangling_references(|_| false);
    for (device, target) in &dangling {
        warn!(device = %device, target = %target, "unresolved device reference");
    }

    Ok(ExitCode::SUCCESS)
}
