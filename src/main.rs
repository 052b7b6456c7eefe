//! Otoyaku - Translation Dispatch Engine
//!
//! CLI entry point. Wires the strategy registry, cache, and context
//! processor into a translation manager and drives it from subcommands.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tracing_appender::{non_blocking, rolling};

use otoyaku::cache::CacheManager;
use otoyaku::cli::{Args, CacheAction, Commands, PluginAction, StrategyAction, split_extension};
use otoyaku::config::Config;
use otoyaku::manager::TranslationManager;
use otoyaku::request::{TranslationContext, TranslationRequest};
use otoyaku::segment::ContextProcessor;
use otoyaku::strategy::{ProviderFactory, StrategyLoader, StrategyRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(args.verbose)?;

    // Load configuration
    let config = match &args.config {
        Some(config_path) => Config::from_file(config_path)?,
        None => {
            if std::path::Path::new("config.toml").exists() {
                info!("Found config.toml in current directory, loading...");
                Config::from_file("config.toml")?
            } else {
                Config::default()
            }
        }
    };

    // Init needs no engine; handle it before wiring anything up.
    if let Commands::Init { path } = &args.command {
        if path.exists() {
            anyhow::bail!("refusing to overwrite existing file: {}", path.display());
        }
        Config::default().save_to_file(path)?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(());
    }

    // Assemble the engine: registry from configured strategies, plugin
    // discovery on top, then the manager with its collaborators injected.
    let registry = Arc::new(StrategyRegistry::new());
    for strategy_config in &config.strategies {
        match ProviderFactory::build(strategy_config) {
            Ok(provider) => {
                if !registry.register(&strategy_config.name, provider) {
                    warn!("Duplicate strategy in config, keeping first: {}", strategy_config.name);
                }
            }
            Err(e) => warn!("Skipping strategy '{}': {}", strategy_config.name, e),
        }
    }
    let loader = StrategyLoader::new(config.plugins.locations.clone());
    let loaded = loader.load(&registry);
    if loaded > 0 {
        info!("Loaded {} plugin strategies", loaded);
    }

    let cache = Arc::new(CacheManager::from_config(&config.cache));
    let processor = Arc::new(ContextProcessor::new(&config.segment)?);
    let manager = Arc::new(TranslationManager::new(
        &config,
        registry.clone(),
        cache.clone(),
        processor,
    ));

    match args.command {
        Commands::Translate {
            names,
            from,
            to,
            strategy,
            domain,
        } => {
            let mut failed = 0usize;
            for name in &names {
                let (stem, ext) = split_extension(name);
                let mut request = TranslationRequest::new(stem, from.clone(), to.clone());
                if let Some(strategy) = &strategy {
                    request = request.with_strategy(strategy.clone());
                }
                if let Some(domain) = &domain {
                    request = request.with_context(TranslationContext {
                        domain: Some(domain.clone()),
                        ..Default::default()
                    });
                }

                match manager.translate(request).await {
                    Ok(result) => {
                        let served_by: Vec<&str> = result
                            .segments
                            .iter()
                            .map(|s| s.strategy.as_str())
                            .collect();
                        println!("{} -> {}{}", name, result.text, ext);
                        info!(
                            "Served by [{}], cache hit ratio {:.2}",
                            served_by.join(", "),
                            result.cache_hit_ratio
                        );
                    }
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}: {}", name, e);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} of {} names failed", failed, names.len());
            }
        }

        Commands::Batch {
            input,
            from,
            to,
            output,
            strategy,
        } => {
            let content = tokio::fs::read_to_string(&input).await?;
            let names: Vec<String> = content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect();
            if names.is_empty() {
                println!("Nothing to translate in {}", input.display());
                return Ok(());
            }

            let pb = ProgressBar::new(names.len() as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
                    .unwrap()
                    .progress_chars("#>-"),
            );

            let requests: Vec<TranslationRequest> = names
                .iter()
                .map(|name| {
                    let (stem, _) = split_extension(name);
                    let mut request = TranslationRequest::new(stem, from.clone(), to.clone());
                    if let Some(strategy) = &strategy {
                        request = request.with_strategy(strategy.clone());
                    }
                    request
                })
                .collect();

            // The manager parallelizes across its worker pool; chunking here
            // keeps the progress bar honest.
            let mut rendered = Vec::with_capacity(names.len());
            let mut failed = 0usize;
            for (chunk_names, chunk_requests) in names
                .chunks(16)
                .zip(requests.chunks(16).map(|chunk| chunk.to_vec()))
            {
                let results = manager.translate_batch(chunk_requests).await;
                for (name, result) in chunk_names.iter().zip(results) {
                    let (_, ext) = split_extension(name);
                    match result {
                        Ok(result) => rendered.push(format!("{}\t{}{}", name, result.text, ext)),
                        Err(e) => {
                            failed += 1;
                            rendered.push(format!("{}\tERROR: {}", name, e));
                        }
                    }
                    pb.inc(1);
                }
            }
            pb.finish_and_clear();

            match output {
                Some(path) => {
                    let header = format!(
                        "# otoyaku batch {} -> {} at {}\n",
                        from,
                        to,
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
                    );
                    tokio::fs::write(&path, header + &rendered.join("\n") + "\n").await?;
                    println!("Wrote {} results to {}", rendered.len(), path.display());
                }
                None => {
                    for line in &rendered {
                        println!("{}", line);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{} of {} names failed", failed, names.len());
            }
        }

        Commands::Strategies { action } => match action {
            StrategyAction::List => {
                let descriptors = manager.list_strategies();
                if descriptors.is_empty() {
                    println!("No strategies registered.");
                } else {
                    println!(
                        "\n{:<16} {:<8} {:<12} {:<10} {:<10} {:<12}",
                        "Name", "Batch", "Credential", "Requests", "Failures", "Avg (ms)"
                    );
                    println!("{}", "-".repeat(72));
                    for d in descriptors {
                        println!(
                            "{:<16} {:<8} {:<12} {:<10} {:<10} {:<12}",
                            d.name,
                            if d.capabilities.supports_batch { "yes" } else { "no" },
                            if d.capabilities.requires_credential { "required" } else { "-" },
                            d.metrics.total_requests,
                            d.metrics.failure_count,
                            d.metrics.average_latency_ms,
                        );
                    }
                }
            }
            StrategyAction::Test { name } => {
                let status = manager.test_strategy(&name).await?;
                println!("{}: {}", name, status);
            }
        },

        Commands::Cache { action } => match action {
            CacheAction::Info => {
                let stats = cache.stats().await;
                println!("Entries:   {}", stats.entries);
                println!("Hits:      {}", stats.hits);
                println!("Misses:    {}", stats.misses);
                println!("Evictions: {}", stats.evictions);
                println!("Hit rate:  {:.2}", stats.hit_rate());
            }
            CacheAction::Clear => {
                let removed = cache.clear().await?;
                println!("Cleared {} cache entries", removed);
            }
            CacheAction::Invalidate { pattern } => {
                let removed = manager.invalidate_cache(&pattern).await?;
                println!("Invalidated {} cache entries", removed);
            }
        },

        Commands::Plugins { action } => match action {
            PluginAction::List => {
                let candidates = loader.discover();
                if candidates.is_empty() {
                    println!("No plugin descriptors found.");
                } else {
                    println!("\n{:<16} {:<12} {:<50}", "Name", "Kind", "Path");
                    println!("{}", "-".repeat(78));
                    for candidate in candidates {
                        println!(
                            "{:<16} {:<12} {:<50}",
                            candidate.config.name,
                            format!("{:?}", candidate.config.kind).to_lowercase(),
                            candidate.path.display()
                        );
                    }
                }
            }
            PluginAction::Reload => {
                let count = loader.load(&registry);
                println!("Reloaded plugins: {} strategies (re)registered", count);
            }
        },

        Commands::Init { .. } => unreachable!("handled above"),
    }

    Ok(())
}

/// Setup logging to both console and file
fn setup_logging(verbose: bool) -> Result<()> {
    let otoyaku_dir = std::env::current_dir()?.join(".otoyaku");
    let log_dir = otoyaku_dir.join("log");
    std::fs::create_dir_all(&log_dir)?;

    // Daily rotation; the guard must outlive the program
    let file_appender = rolling::daily(&log_dir, "otoyaku.log");
    let (non_blocking_file, _guard) = non_blocking(file_appender);
    std::mem::forget(_guard);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };

    let console_layer = fmt::layer()
        .with_target(false)
        .with_file(true)
        .with_line_number(true);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(false);

    let subscriber = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(console_layer)
        .with(file_layer);

    subscriber
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
