// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;

use webimg::cache::{CacheStats, FileDiskStore};
use webimg::config::{config_dir, load_config, save_config, WebImageConfig};
use webimg::download::DownloadProgress;
use webimg::manager::ProgressCallback;
use webimg::prefetch::PrefetchProgress;
use webimg::sync::resilient_lock;
use webimg::{strip_query_filter, FetchOptions, ImageResponse, Prefetcher, WebImageManager};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// webimg - fetch, decode and cache images.
#[derive(Parser)]
#[command(name = "webimg")]
#[command(version = VERSION)]
#[command(about = "Asynchronous image downloading with a memory/disk cache.")]
#[command(long_about = "webimg - image fetch and cache engine\n\n\
    Fetch an image:      webimg fetch https://example.com/cat.png -o cat.png\n\
    Warm the cache:      webimg prefetch URL1 URL2 URL3\n\
    Cache statistics:    webimg cache stats\n\
    Show a cache key:    webimg key URL --strip-query")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Quiet mode: only warnings and errors are logged
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Load one image through the cache
    ///
    /// Examples:
    ///   webimg fetch https://example.com/cat.png
    ///   webimg fetch https://example.com/cat.png -o cat.png --refresh
    ///   webimg fetch https://example.com/cat.png --options high-priority,scale-down-large-images
    Fetch {
        /// Image URL
        url: String,
        /// Write the image to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Revalidate a cached image against the network
        #[arg(long)]
        refresh: bool,
        /// Do not write the result to the disk cache
        #[arg(long)]
        memory_only: bool,
        /// Retry even if this URL failed before
        #[arg(long)]
        retry_failed: bool,
        /// Extra options, comma separated (e.g. "high-priority,ignore-cache")
        #[arg(long, value_name = "FLAGS")]
        options: Option<FetchOptions>,
    },

    /// Warm the cache with many images
    ///
    /// Examples:
    ///   webimg prefetch URL1 URL2 URL3 -c 4
    Prefetch {
        /// Image URLs
        #[arg(required = true)]
        urls: Vec<String>,
        /// Concurrent loads
        #[arg(short = 'c', long)]
        concurrency: Option<usize>,
    },

    /// Inspect or manage the cache
    Cache {
        #[command(subcommand)]
        command: Option<CacheCommands>,
    },

    /// Show the cache key and disk file for a URL
    Key {
        url: String,
        /// Ignore query string and fragment
        #[arg(long)]
        strip_query: bool,
    },

    /// Show or initialise the configuration file
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
enum CacheCommands {
    /// Show cache statistics
    Stats,
    /// Remove every cached image
    Clear,
    /// Run one eviction sweep now
    Sweep,
    /// Check whether a URL is cached on disk
    Contains { url: String },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write the defaults to ~/.webimg/config.json
    Init,
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else if cli.quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = load_config()?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(run(cli.command, config))
}

async fn run(command: Commands, config: WebImageConfig) -> Result<()> {
    match command {
        Commands::Config { command } => handle_config(command.unwrap_or(ConfigCommands::Show), &config),
        Commands::Key { url, strip_query } => handle_key(&url, strip_query, &config),
        command => {
            let manager = WebImageManager::from_config(&config)?;
            match command {
                Commands::Fetch {
                    url,
                    output,
                    refresh,
                    memory_only,
                    retry_failed,
                    options,
                } => {
                    let mut options = options.unwrap_or_default();
                    if refresh {
                        options |= FetchOptions::REFRESH_CACHED;
                    }
                    if memory_only {
                        options |= FetchOptions::CACHE_MEMORY_ONLY;
                    }
                    if retry_failed {
                        options |= FetchOptions::RETRY_FAILED;
                    }
                    handle_fetch(&manager, &url, options, output).await
                }
                Commands::Prefetch { urls, concurrency } => {
                    handle_prefetch(&manager, &config, urls, concurrency).await
                }
                Commands::Cache { command } => {
                    handle_cache(&manager, &config, command.unwrap_or(CacheCommands::Stats)).await
                }
                Commands::Config { .. } | Commands::Key { .. } => Ok(()),
            }
        }
    }
}

fn byte_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} | {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn transfer_message(progress: &DownloadProgress) -> String {
    match (progress.speed_string(), progress.eta_string()) {
        (Some(speed), Some(eta)) => format!("{} - ETA {}", speed, eta),
        (Some(speed), None) => speed,
        _ => "Downloading...".to_string(),
    }
}

fn print_lookups(stats: &CacheStats) {
    println!(
        "  Lookups:        {} memory, {} disk, {} misses ({:.0}% hit rate)",
        stats.memory_hits,
        stats.disk_hits,
        stats.misses,
        stats.hit_rate() * 100.0
    );
}

async fn handle_fetch(
    manager: &WebImageManager,
    url: &str,
    options: FetchOptions,
    output: Option<PathBuf>,
) -> Result<()> {
    println!();
    println!("{} Fetching {}", "[↓]".cyan(), url.white().bold());
    if !options.is_empty() {
        println!("    options: {}", options.to_string().dimmed());
    }
    println!();

    let pb = byte_bar();
    pb.set_message("Looking up cache...");
    let bar = pb.clone();
    let rate = Mutex::new(DownloadProgress::new());
    let on_progress: ProgressCallback = Arc::new(move |received, expected| {
        if let Some(total) = expected {
            bar.set_length(total);
        }
        bar.set_position(received);
        let mut rate = resilient_lock(&rate);
        rate.update(received, expected);
        bar.set_message(transfer_message(&rate));
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<ImageResponse>();
    let _handle = manager.load(url, options, Some(on_progress), move |response| {
        let _ = tx.send(response);
    });

    let mut last = None;
    while let Some(response) = rx.recv().await {
        if response.finished {
            last = Some(response);
            break;
        }
        if let Some(image) = response.image() {
            pb.println(format!(
                "  {} interim {}x{} from {}",
                "[~]".yellow(),
                image.width(),
                image.height(),
                response.origin().as_str()
            ));
        }
    }
    pb.finish_and_clear();

    let response = last.context("Load ended without a result")?;
    let loaded = match response.result {
        Ok(loaded) => loaded,
        Err(e) => {
            println!("{} {}", "[✗]".red(), e);
            anyhow::bail!("fetch failed: {}", e);
        }
    };

    let image = &loaded.image;
    println!(
        "{} {} {}x{} ({}{})",
        "[✓]".green(),
        image.format().extension().to_uppercase(),
        image.width(),
        image.height(),
        loaded.origin.as_str(),
        if image.is_animated() {
            format!(", {} frames", image.frames().len())
        } else {
            String::new()
        }
    );

    if let Some(path) = output {
        let data = match loaded.data.clone() {
            Some(data) => data,
            None => manager.codecs().encode(image, image.format())?,
        };
        std::fs::write(&path, &data).with_context(|| format!("Failed to write {:?}", path))?;
        println!("    saved {} bytes to {}", data.len(), path.display().to_string().dimmed());
    }
    println!();
    Ok(())
}

async fn handle_prefetch(
    manager: &WebImageManager,
    config: &WebImageConfig,
    urls: Vec<String>,
    concurrency: Option<usize>,
) -> Result<()> {
    let prefetcher = Prefetcher::new(manager.clone(), &config.prefetch);
    if let Some(max) = concurrency {
        prefetcher.set_max_concurrent(max);
    }

    println!();
    println!(
        "{} Prefetching {} images ({} at a time)",
        "[↓]".cyan(),
        urls.len(),
        prefetcher.max_concurrent()
    );
    println!();

    let pb = ProgressBar::new(urls.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} [{bar:40.cyan/blue}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
    );
    let bar = pb.clone();
    let on_progress: PrefetchProgress = Arc::new(move |finished, _total| {
        bar.set_position(finished as u64);
    });

    let outcome = prefetcher.prefetch_and_wait(urls, Some(on_progress)).await;
    pb.finish_and_clear();

    match outcome {
        Some((finished, skipped)) if skipped == 0 => {
            println!("{} {} images cached", "[✓]".green(), finished);
        }
        Some((finished, skipped)) => {
            println!(
                "{} {} finished, {} skipped",
                "[!]".yellow(),
                finished,
                skipped.to_string().red()
            );
        }
        None => println!("{} Prefetch cancelled", "[!]".yellow()),
    }
    print_lookups(&manager.cache().stats());
    println!();
    Ok(())
}

fn disk_path(config: &WebImageConfig) -> PathBuf {
    config
        .cache
        .disk_path
        .clone()
        .unwrap_or_else(FileDiskStore::default_path)
}

async fn handle_cache(
    manager: &WebImageManager,
    config: &WebImageConfig,
    command: CacheCommands,
) -> Result<()> {
    let cache = manager.cache();
    match command {
        CacheCommands::Stats => {
            println!();
            println!("{}", "=== Cache Statistics ===".bright_cyan().bold());
            println!();
            let size = cache.disk_size().await;
            println!("  Disk entries:   {}", cache.disk_count().await.to_string().white().bold());
            println!(
                "  Disk size:      {} bytes ({:.2} MB)",
                size.to_string().white(),
                size as f64 / 1_048_576.0
            );
            if config.cache.disk_max_size > 0 {
                println!("  Disk budget:    {} bytes", config.cache.disk_max_size);
            }
            println!(
                "  Max age:        {} days",
                config.cache.disk_max_age_secs / 86_400
            );
            println!(
                "  Memory budget:  {:.1} MB",
                cache.stats().memory_cost_limit as f64 / 1_048_576.0
            );
            println!("  Location:       {}", disk_path(config).display().to_string().dimmed());
            println!();
        }
        CacheCommands::Clear => {
            cache.clear_memory();
            cache.clear_disk().await?;
            println!("{} Cache cleared", "[✓]".green());
        }
        CacheCommands::Sweep => {
            let report = cache.sweep_disk().await?;
            println!(
                "{} Removed {} expired and {} oversize entries ({} bytes freed, {} remaining)",
                "[✓]".green(),
                report.expired_removed,
                report.oversize_removed,
                report.bytes_freed,
                report.bytes_remaining
            );
        }
        CacheCommands::Contains { url } => {
            if manager.disk_image_exists(&url).await {
                println!("{} cached: {}", "[✓]".green(), url);
            } else {
                println!("{} not cached: {}", "[✗]".red(), url);
            }
        }
    }
    Ok(())
}

fn handle_key(url: &str, strip_query: bool, config: &WebImageConfig) -> Result<()> {
    let key = if strip_query {
        strip_query_filter()(url)
    } else {
        url.to_string()
    };
    let store = FileDiskStore::new(disk_path(config))?;
    println!("  key:  {}", key.white().bold());
    println!("  file: {}", store.path_for(&key).display().to_string().dimmed());
    Ok(())
}

fn handle_config(command: ConfigCommands, config: &WebImageConfig) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ConfigCommands::Init => {
            let path = config_dir()?.join("config.json");
            if path.exists() {
                println!("{} {} already exists", "[!]".yellow(), path.display());
            } else {
                save_config(&WebImageConfig::default())?;
                println!("{} Wrote {}", "[✓]".green(), path.display());
            }
        }
    }
    Ok(())
}
