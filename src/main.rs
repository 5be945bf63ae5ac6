//! tilecache
//!
//! Maintenance tool for a tile cache directory.
//!
//! # Commands
//!
//! ```text
//! tilecache info    restore the saved indices and print cache statistics
//! tilecache trim    restore, evict down to the configured budgets, save
//! tilecache clear   restore, drop every entry, save the empty indices
//! tilecache wipe    delete the cache tree and recreate its layout
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tilecache::{CacheManager, CacheSettings};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tilecache - Tiered image and frame cache maintenance
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cache root directory (overrides the settings file)
    #[arg(long, env = "TILECACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// YAML settings file
    #[arg(long, env = "TILECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print cache statistics as JSON
    Info,
    /// Evict entries beyond the configured budgets
    Trim,
    /// Remove every cached entry
    Clear,
    /// Delete the cache directory and recreate its structure
    Wipe,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut settings = match &args.config {
        Some(path) => CacheSettings::from_yaml_file(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => CacheSettings::default(),
    };
    if let Some(dir) = &args.cache_dir {
        settings.cache_location = Some(dir.clone());
    }

    let manager = CacheManager::new(settings).context("initializing caches")?;
    info!("Cache root: {}", manager.cache_root().display());

    match args.command {
        Command::Info => {
            let restored = manager.restore_caches();
            info!("Restored {} entries", restored);
            println!("{}", serde_json::to_string_pretty(&manager.stats())?);
        }
        Command::Trim => {
            manager.restore_caches();
            manager.node_cache().clear_exceeding_entries();
            manager.disk_cache().clear_exceeding_entries();
            manager.viewer_cache().clear_exceeding_entries();
            manager.save_caches();
            info!(
                "Trimmed caches to {} bytes in memory",
                manager.caches_total_memory_size()
            );
        }
        Command::Clear => {
            manager.restore_caches();
            manager.clear_all_caches();
            manager.save_caches();
            info!("Cleared all caches");
        }
        Command::Wipe => {
            manager
                .wipe_and_create_disk_cache_structure()
                .context("wiping cache directory")?;
            info!("Recreated {}", manager.cache_root().display());
        }
    }

    manager.shutdown();
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so `info` output stays parseable.
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
