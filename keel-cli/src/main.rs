//! Keel CLI

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use keel_plugin_runtime::registry::calculate_load_order;
use keel_plugin_runtime::{
    HotReloadWatcher, PluginCandidate, PluginDiscovery, PluginLoader, PluginRegistry,
    RuntimeConfig, SortKey,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Keel plugin runtime", long_about = None)]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info", env = "KEEL_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SortBy {
    Priority,
    Name,
    Version,
}

impl From<SortBy> for SortKey {
    fn from(sort: SortBy) -> Self {
        match sort {
            SortBy::Priority => SortKey::Priority,
            SortBy::Name => SortKey::Name,
            SortBy::Version => SortKey::Version,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List plugin modules found in directories
    Discover {
        /// Directories to scan
        #[arg(required = true)]
        dirs: Vec<PathBuf>,

        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,

        /// Candidate ordering
        #[arg(short, long, value_enum, default_value = "priority")]
        sort: SortBy,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the metadata a module exports
    Inspect {
        /// Module path
        module: PathBuf,
    },

    /// Compute the order plugins in a directory would load in
    LoadOrder {
        /// Directories to scan
        #[arg(required = true)]
        dirs: Vec<PathBuf>,
    },

    /// Validate a runtime configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "keel.yaml")]
        config: PathBuf,
    },

    /// Load every plugin in the configured search paths and drive updates
    Run {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Extra plugin directories
        #[arg(short, long)]
        dir: Vec<PathBuf>,

        /// Update rate in ticks per second
        #[arg(long, default_value_t = 60)]
        tick_rate: u32,

        /// Stop after this many ticks
        #[arg(long)]
        ticks: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command {
        Commands::Discover {
            dirs,
            recursive,
            sort,
            json,
        } => discover(&dirs, recursive, sort.into(), json),
        Commands::Inspect { module } => inspect(&module),
        Commands::LoadOrder { dirs } => load_order(&dirs),
        Commands::Validate { config } => validate(&config),
        Commands::Run {
            config,
            dir,
            tick_rate,
            ticks,
        } => run(config, dir, tick_rate, ticks).await,
    }
}

fn scan(dirs: &[PathBuf], recursive: bool) -> Vec<PluginCandidate> {
    let discovery = PluginDiscovery::new(Arc::new(PluginLoader::new())).with_recursive(recursive);
    for dir in dirs {
        discovery.add_directory(dir.clone());
    }
    discovery.scan()
}

fn discover(dirs: &[PathBuf], recursive: bool, sort: SortKey, json: bool) -> Result<()> {
    let mut candidates = scan(dirs, recursive);
    keel_plugin_runtime::discovery::sort_candidates(&mut candidates, sort);

    if json {
        println!("{}", serde_json::to_string_pretty(&candidates)?);
        return Ok(());
    }

    if candidates.is_empty() {
        println!("No plugins found");
        return Ok(());
    }
    for candidate in &candidates {
        match (&candidate.metadata, candidate.valid) {
            (Some(meta), true) => println!(
                "✓ {:<24} {:<12} {:<8} {}",
                meta.name,
                meta.version,
                candidate.priority(),
                candidate.path.display()
            ),
            _ => println!(
                "✗ {:<24} {}: {}",
                candidate.name,
                candidate.path.display(),
                candidate.error_message.as_deref().unwrap_or("invalid")
            ),
        }
    }
    Ok(())
}

fn inspect(module: &Path) -> Result<()> {
    let loader = Arc::new(PluginLoader::new());
    let mut metadata = loader
        .inspect(module)
        .with_context(|| format!("failed to inspect {}", module.display()))?;
    PluginDiscovery::new(Arc::clone(&loader)).merge_sidecar(module, &mut metadata)?;
    println!("{}", serde_json::to_string_pretty(&metadata)?);
    Ok(())
}

fn load_order(dirs: &[PathBuf]) -> Result<()> {
    let candidates = scan(dirs, false);
    let metadata: Vec<_> = candidates
        .into_iter()
        .filter(|c| c.valid)
        .filter_map(|c| c.metadata)
        .collect();

    let order = calculate_load_order(&metadata, &HashMap::new())?;
    for (index, entry) in order.entries().iter().enumerate() {
        println!("{:>3}. {:<24} {}", index + 1, entry.name, entry.priority);
    }
    Ok(())
}

fn validate(config: &Path) -> Result<()> {
    tracing::info!("Checking runtime config {}", config.display());

    match RuntimeConfig::load_from_file(config) {
        Ok(cfg) => {
            tracing::info!("✓ {} is a valid runtime config", config.display());
            tracing::info!("  Plugin dir: {}", cfg.plugins.plugin_dir.display());
            tracing::info!("  Search paths: {}", cfg.plugins.search_paths.len());
            tracing::info!("  Max plugins: {}", cfg.plugins.max_plugins);
            tracing::info!("  Message workers: {}", cfg.messaging.worker_count);
            tracing::info!("  Hot reload: {}", cfg.hot_reload.enabled);
            Ok(())
        }
        Err(e) => {
            tracing::error!("✗ {}: {}", config.display(), e);
            std::process::exit(1);
        }
    }
}

async fn run(
    config: Option<PathBuf>,
    dirs: Vec<PathBuf>,
    tick_rate: u32,
    ticks: Option<u64>,
) -> Result<()> {
    if tick_rate == 0 {
        bail!("tick rate must be positive");
    }

    let mut config = match config {
        Some(path) => RuntimeConfig::load_from_file(&path)?,
        None => RuntimeConfig::default(),
    };
    config.plugins.search_paths.extend(dirs);
    if config.plugins.search_paths.is_empty() {
        bail!("no plugin directories configured");
    }

    let hot_reload = config.hot_reload.enabled;
    let search_paths = config.plugins.search_paths.clone();
    let registry = PluginRegistry::new(config)?;
    registry.start();

    for dir in &search_paths {
        match registry.load_directory(dir).await {
            Ok(loaded) => tracing::info!(dir = %dir.display(), plugins = ?loaded, "Plugins loaded"),
            Err(e) => tracing::error!(dir = %dir.display(), error = %e, "Failed to load plugins"),
        }
    }

    let mut watcher = if hot_reload {
        let (tx, mut reports) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = HotReloadWatcher::new(registry.clone()).with_reports(tx);
        watcher.start()?;
        watcher.run()?;
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                if report.succeeded() {
                    tracing::info!(plugin = %report.plugin_name, "Reloaded");
                } else {
                    tracing::warn!(
                        plugin = %report.plugin_name,
                        error = report.error.as_deref().unwrap_or_default(),
                        "Reload failed"
                    );
                }
            }
        });
        Some(watcher)
    } else {
        None
    };

    let period = Duration::from_secs_f64(1.0 / f64::from(tick_rate));
    let mut interval = tokio::time::interval(period);
    let mut last = Instant::now();
    let mut count = 0u64;

    tracing::info!(plugins = registry.plugin_names().len(), tick_rate, "Runtime running");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = interval.tick() => {
                let delta = last.elapsed().as_secs_f64();
                last = Instant::now();
                registry.update_plugins(delta).await;
                count += 1;
                if ticks.is_some_and(|limit| count >= limit) {
                    break;
                }
            }
        }
    }

    if let Some(watcher) = watcher.as_mut() {
        watcher.stop();
    }
    let stats = registry.stats();
    registry.shutdown().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true),
        )
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(filter.into()))
        .init();

    Ok(())
}
