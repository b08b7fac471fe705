//! jmaps CLI - inspect and maintain a JourneyMAPS result store
//!
//! Journeys themselves are defined in code against the library; this binary
//! works on what they leave behind:
//!
//! 1. Config: jmaps.toml or `[tool.jmaps]` in pyproject.toml picks the store
//! 2. Store: open the configured redb, fs or memory backend
//! 3. Query: list paths and entries, show one entry, chart a path's history
//! 4. Maintain: remove single entries or clear the store

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use jmaps::cache::{CanonicalKey, Entry, LookupCache};
use jmaps::config::Config;
use jmaps::path::PathIdentity;
use jmaps::report::{HistorySummary, entry_detail, entry_line, sparkline};

/// Width of the history sparkline, in cells.
const SPARKLINE_WIDTH: usize = 40;

/// Inspect cached JourneyMAPS results
///
/// Every path run through a journey is cached under a key derived from its
/// Settings and Variables. jmaps lists, inspects and prunes those entries
/// without running anything.
///
/// Examples:
///   jmaps stats                      # Store size and entry counts
///   jmaps list --path anneal         # Entries of one path
///   jmaps history --path anneal      # Figure of merit over time
///   jmaps show 3fa2...               # Full entry with snapshot
#[derive(Parser, Debug)]
#[command(name = "jmaps")]
#[command(version)]
#[command(about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Project root directory
    ///
    /// Where to look for jmaps.toml or pyproject.toml. The store path in
    /// the config is resolved relative to the file that sets it.
    /// Defaults to current directory.
    #[arg(short, long, default_value = ".", global = true)]
    pub root: PathBuf,

    /// Verbose output
    ///
    /// Prints the resolved config and raises the log level to debug.
    /// RUST_LOG still takes precedence when set.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Entry count, path count and on-disk size of the store
    Stats,

    /// Every path that has at least one stored entry
    Paths,

    /// One line per stored entry
    ///
    /// Shows key prefix, figure of merit, creation time and the identity
    /// parameters of each entry.
    List {
        /// Only entries of paths with this name (any version)
        #[arg(short, long)]
        path: Option<String>,
    },

    /// Full detail of one entry, including snapshot and prior runs
    Show {
        /// Full 64-character hex key
        key: String,

        /// Print the entry as JSON instead of formatted text
        #[arg(long)]
        json: bool,
    },

    /// Figure of merit over time for one path
    ///
    /// Entries are ordered by creation time. The objective and direction
    /// come from the [optimizer] section of the config.
    History {
        #[arg(short, long)]
        path: String,
    },

    /// Delete one entry
    Remove {
        /// Full 64-character hex key
        key: String,
    },

    /// Delete every entry in the store
    Clear,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("cannot resolve root {}", cli.root.display()))?;
    let config = Config::load(&root);

    if cli.verbose {
        eprintln!("🗺️  jmaps v{}", env!("CARGO_PKG_VERSION"));
        eprintln!("📂 Root: {}", root.display());
        eprintln!("{}", config.display_summary());
    }

    let store = config
        .open_store()
        .with_context(|| format!("cannot open store at {}", config.store.path.display()))?;
    let cache = LookupCache::new(Arc::clone(&store));

    match cli.command {
        Command::Stats => {
            let stats = store.stats();
            println!("{} {}", "Store:".bold(), config.store.path.display());
            println!("   backend   {}", config.store.backend);
            println!("   entries   {}", stats.entries);
            println!("   paths     {}", stats.paths);
            println!("   size      {}", stats.size_human());
        }
        Command::Paths => {
            let mut paths = cache.paths()?;
            paths.sort_by(|a, b| (&a.name, a.version).cmp(&(&b.name, b.version)));
            if paths.is_empty() {
                eprintln!("No stored paths");
            }
            for path in paths {
                let count = cache.history(&path)?.len_hint();
                println!("{}  {} entries", path.cyan(), count);
            }
        }
        Command::List { path } => {
            let paths = select_paths(&cache, path.as_deref())?;
            let mut shown = 0;
            for path in &paths {
                let entries = collect_entries(&cache, path)?;
                if entries.is_empty() {
                    continue;
                }
                println!("{}", path.bold());
                for entry in &entries {
                    println!("  {}", entry_line(entry));
                }
                shown += entries.len();
            }
            if shown == 0 {
                eprintln!("No entries");
            }
        }
        Command::Show { key, json } => {
            let key = parse_key(&key)?;
            let Some(entry) = cache.get(&key)? else {
                bail!("no entry for key {key}");
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                println!("{}", entry_detail(&entry));
            }
        }
        Command::History { path } => {
            let paths = select_paths(&cache, Some(&path))?;
            if paths.is_empty() {
                bail!("no stored path named {path:?}");
            }
            let mut entries = Vec::new();
            for identity in &paths {
                entries.extend(collect_entries(&cache, identity)?);
            }

            let opt = &config.optimizer;
            let summary =
                HistorySummary::from_entries(entries, opt.objective.as_deref(), opt.direction);
            println!(
                "{} {} ({} scored, {} unscored, {})",
                "History:".bold(),
                path,
                summary.scores.len(),
                summary.unscored,
                opt.direction
            );
            println!("   {}", sparkline(&summary.scores, SPARKLINE_WIDTH).cyan());
            if let Some(delta) = summary.delta(opt.direction) {
                println!("   first → last: {delta}");
            }
            if let Some(best) = &summary.best {
                println!("{}", "Best:".bold());
                println!("  {}", entry_line(best));
            }
        }
        Command::Remove { key } => {
            let key = parse_key(&key)?;
            if cache.remove(&key)? {
                eprintln!("✓ Removed {}", key.short());
            } else {
                bail!("no entry for key {key}");
            }
        }
        Command::Clear => {
            let before = store.stats().entries;
            store.clear().context("failed to clear store")?;
            eprintln!("✓ Cleared {before} entries");
        }
    }

    Ok(())
}

/// Log to stderr; RUST_LOG wins over --verbose.
fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn parse_key(hex: &str) -> Result<CanonicalKey> {
    CanonicalKey::from_hex(hex.trim()).with_context(|| format!("invalid key {hex:?}"))
}

/// Stored paths, optionally restricted to one name across all versions.
fn select_paths(cache: &LookupCache, name: Option<&str>) -> Result<Vec<PathIdentity>> {
    let mut paths: Vec<PathIdentity> = cache
        .paths()?
        .into_iter()
        .filter(|p| name.is_none_or(|n| p.name == n))
        .collect();
    paths.sort_by(|a, b| (&a.name, a.version).cmp(&(&b.name, b.version)));
    Ok(paths)
}

/// Entries of one path, oldest first. Unreadable records are skipped with
/// a warning rather than aborting the listing.
fn collect_entries(cache: &LookupCache, path: &PathIdentity) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for item in cache.history(path)? {
        match item {
            Ok(entry) => entries.push(entry),
            Err(e) => tracing::warn!(path = %path.name, error = %e, "skipping unreadable entry"),
        }
    }
    entries.sort_by_key(|e| e.created_at);
    Ok(entries)
}
