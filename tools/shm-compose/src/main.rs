//! shm-compose - compose and exercise shared-page broker systems
//!
//! Commands:
//! - `shm-compose new <file>` - Write a system description template
//! - `shm-compose check <file>` - Validate a system description
//! - `shm-compose run <file>` - Boot the system on the hosted platform and replay its steps
//! - `shm-compose info` - Show broker defaults

mod run;
mod system;

use clap::{Parser, Subcommand};
use colored::Colorize;
use shm_broker::BrokerConfig;
use std::fs;
use std::path::{Path, PathBuf};
use system::SystemSpec;

#[derive(Parser)]
#[command(name = "shm-compose")]
#[command(author = "KaaL Team")]
#[command(version)]
#[command(about = "Shared-page broker system composer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a new system description
    New {
        /// Output file
        file: PathBuf,
    },

    /// Validate a system description
    Check {
        /// System description file
        file: PathBuf,
    },

    /// Boot the system and replay its steps
    Run {
        /// System description file
        file: PathBuf,

        /// Broker debug logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show broker defaults
    Info,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.command {
        Commands::Run { verbose: true, .. } => "debug",
        _ => "info",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::New { file } => {
            create_system(&file)?;
        }

        Commands::Check { file } => {
            check_system(&file)?;
        }

        Commands::Run { file, .. } => {
            run_system(&file)?;
        }

        Commands::Info => {
            show_info();
        }
    }

    Ok(())
}

fn create_system(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("'{}' already exists", path.display());
    }

    fs::write(path, system::TEMPLATE)?;

    println!("{} Created {}\n", "✅".green(), path.display().to_string().bold());
    println!("Next steps:");
    println!("  shm-compose check {}", path.display());
    println!("  shm-compose run {}", path.display());

    Ok(())
}

fn check_system(path: &Path) -> anyhow::Result<()> {
    let spec = SystemSpec::load(path)?;

    println!("{} {} is valid", "✅".green(), path.display().to_string().bold());
    println!("  Domains:   {} (broker is {})", spec.boot.domains, spec.broker.broker_domain);
    println!("  Window:    {:#x} + {} pages", spec.broker.window_base, spec.broker.window_pages);
    println!("  Regions:   up to {}", spec.broker.max_regions);
    println!("  Steps:     {}", spec.steps.len());

    Ok(())
}

fn run_system(path: &Path) -> anyhow::Result<()> {
    let spec = SystemSpec::load(path)?;

    println!("{} Booting {} domains...", "🚀".green(), spec.boot.domains);
    let report = run::run(&spec)?;
    println!("  Registered {} client domains\n", report.registered);

    for (index, outcome) in report.outcomes.iter().enumerate() {
        let mark = if outcome.passed {
            "ok".green()
        } else {
            "FAIL".red().bold()
        };
        println!("  [{:>2}] {:<40} {} {}", index + 1, outcome.step, mark, outcome.detail.dimmed());
    }

    println!(
        "\n  {} calls served, {} regions allocated",
        report.calls_served, report.regions
    );

    if !report.succeeded() {
        anyhow::bail!("{} of {} steps failed", report.failures(), report.outcomes.len());
    }

    println!("{} All {} steps passed", "✅".green(), report.outcomes.len());
    Ok(())
}

fn show_info() {
    let defaults = BrokerConfig::default();

    println!("{}", "shm-compose - shared-page broker composer".bold().green());
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("\nBroker defaults:");
    println!("  page_size     {}", defaults.page_size);
    println!("  window_base   {:#x}", defaults.window_base);
    println!("  window_pages  {}", defaults.window_pages);
    println!("  max_regions   {}", defaults.max_regions);
    println!("  max_domains   {}", defaults.max_domains);
    println!("  broker_domain {}", defaults.broker_domain);
    println!("\nCommands:");
    println!("  shm-compose new <file>    Write a system description");
    println!("  shm-compose check <file>  Validate it");
    println!("  shm-compose run <file>    Boot and replay its steps");
}
