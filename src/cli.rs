use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Translate one or more filenames
    Translate {
        /// Filenames or fragments to translate
        #[arg(required = true)]
        names: Vec<String>,

        /// Source language tag
        #[arg(short, long, default_value = "en")]
        from: String,

        /// Target language tag
        #[arg(short, long)]
        to: String,

        /// Preferred strategy; engine default when omitted
        #[arg(short, long)]
        strategy: Option<String>,

        /// Domain hint forwarded to the provider
        #[arg(short, long)]
        domain: Option<String>,
    },

    /// Translate every filename in a newline-separated list file
    Batch {
        /// Input file with one name per line
        #[arg(short, long)]
        input: PathBuf,

        /// Source language tag
        #[arg(short, long, default_value = "en")]
        from: String,

        /// Target language tag
        #[arg(short, long)]
        to: String,

        /// Write results here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Preferred strategy; engine default when omitted
        #[arg(short, long)]
        strategy: Option<String>,
    },

    /// Inspect and probe registered strategies
    Strategies {
        #[command(subcommand)]
        action: StrategyAction,
    },

    /// Manage the translation cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Manage plugin strategies
    Plugins {
        #[command(subcommand)]
        action: PluginAction,
    },

    /// Write a default configuration file
    Init {
        /// Destination path
        #[arg(short, long, default_value = "config.toml")]
        path: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum StrategyAction {
    /// List registered strategies with capabilities and metrics
    List,

    /// Probe one strategy's backend
    Test {
        /// Strategy name
        #[arg(short, long)]
        name: String,
    },
}

#[derive(Subcommand)]
pub enum CacheAction {
    /// Show cache statistics
    Info,

    /// Remove every cached translation
    Clear,

    /// Remove entries whose key or source text matches a pattern
    Invalidate {
        /// Regex matched against keys and source text
        #[arg(short, long)]
        pattern: String,
    },
}

#[derive(Subcommand)]
pub enum PluginAction {
    /// List discovered plugin descriptors
    List,

    /// Re-run discovery and register new or changed strategies
    Reload,
}

/// Detach a filename extension before translation so it never reaches a
/// provider. Returns the stem and the extension including its dot; names
/// without a plausible extension come back whole.
pub fn split_extension(name: &str) -> (&str, &str) {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= 5
                && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            (stem, &name[stem.len()..])
        }
        _ => (name, ""),
    }
}
