//! # Conductor Configuration Validator
//!
//! Loads a configuration file with its environment overlay and `CONDUCTOR__*`
//! overrides, validates it, and prints the result with credentials redacted.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use conductor_core::config::{ConductorConfig, ConfigManager};
use std::path::PathBuf;
use std::process;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const SECTIONS: [&str; 7] = [
    "load_balancing",
    "failover",
    "batch",
    "cache",
    "pipeline",
    "orchestrator",
    "logging",
];

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate conductor configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment overlay to apply (development, test, production, ...)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Base configuration file (default: config/conductor.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate every section and print a summary
    All,

    /// Print one section of the effective configuration
    Section {
        /// load_balancing, failover, batch, cache, pipeline, orchestrator or logging
        name: String,
    },

    /// Print the whole effective configuration as JSON
    Show,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _ = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    if let Err(e) = run(&cli) {
        eprintln!("❌ Configuration validation failed: {e:#}");
        process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let manager = ConfigManager::load_from_path(cli.config.clone(), &cli.environment)
        .context("loading configuration")?;

    match &cli.command {
        None | Some(Commands::All) => print_summary(&manager),
        Some(Commands::Section { name }) => print_section(&manager, name),
        Some(Commands::Show) => {
            println!("{}", serde_json::to_string_pretty(&manager.debug_config())?);
            Ok(())
        }
    }
}

fn print_summary(manager: &ConfigManager) -> Result<()> {
    let config: &ConductorConfig = manager.config();

    println!("🔧 Conductor configuration");
    println!("Environment: {}", manager.environment());
    match manager.config_path() {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (defaults only)"),
    }
    println!();

    let lb = &config.load_balancing;
    println!("✅ load_balancing");
    println!("   algorithm: {}", lb.algorithm.as_str());
    println!(
        "   health_threshold: {:.2}, failure_threshold: {}, recovery_threshold: {}",
        lb.health_threshold, lb.failure_threshold, lb.recovery_threshold
    );
    println!(
        "   auto_scale: {} ({}..={} workers)",
        lb.auto_scale, lb.min_workers, lb.max_workers
    );

    let failover = &config.failover;
    println!("✅ failover");
    println!(
        "   breaker opens at {} failures, recovery delay {:?}..{:?}",
        failover.breaker_open_threshold,
        failover.recovery_base_delay(),
        failover.recovery_max_delay()
    );

    println!("✅ batch");
    println!(
        "   max_concurrent: {}, retry_attempts: {}",
        config.batch.max_concurrent, config.batch.retry_attempts
    );

    let redis = manager.debug_config()["cache"]["redis_url"].clone();
    println!("✅ cache");
    println!(
        "   redis_url: {}, ttl: {:?}, compression: {}",
        redis,
        config.cache.default_ttl(),
        config.cache.compression_enabled
    );

    println!("✅ pipeline");
    println!(
        "   default_batch_size: {}, required_fields: {:?}",
        config.pipeline.default_batch_size, config.pipeline.required_fields
    );

    println!("\n🎉 All configuration checks passed!");
    Ok(())
}

fn print_section(manager: &ConfigManager, name: &str) -> Result<()> {
    let normalized = name.to_lowercase().replace('-', "_");
    if !SECTIONS.contains(&normalized.as_str()) {
        bail!(
            "unknown section '{name}' (expected one of: {})",
            SECTIONS.join(", ")
        );
    }

    let section = &manager.debug_config()[normalized.as_str()];
    println!("{}", serde_json::to_string_pretty(section)?);
    Ok(())
}
