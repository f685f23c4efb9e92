//! PrefSync CLI
//!
//! Thin wrapper around prefsync-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Set a preference (string unless --kind says otherwise)
//! prefsync set theme dark
//! prefsync set volume 7 --kind int
//!
//! # Read one preference, or all of them
//! prefsync get volume
//! prefsync list
//!
//! # Remove a preference
//! prefsync unset theme
//!
//! # Replicate this store across three simulated nodes
//! prefsync simulate --nodes 3
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prefsync_core::{
    LocalStore, MemoryPan, MemoryStore, PrefSync, PrefValue, RedbStore, StoreEdits, SyncConfig,
    ValueKind, KEY_SYNC_DONE,
};
use tracing::{debug, info};

/// File holding the persistent preference stores inside the data directory
const STORE_FILE: &str = "prefs.redb";

/// How long `simulate` waits for every node to agree
const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// PrefSync - preference replication across a personal-area network
#[derive(Parser)]
#[command(name = "prefsync")]
#[command(version)]
#[command(about = "PrefSync - preference replication across a personal-area network")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: ~/.prefsync/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Named preference store (default: the unnamed store)
    #[arg(short, long, global = true)]
    store: Option<String>,

    /// JSON sync configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print one preference
    Get {
        key: String,
    },

    /// Set a preference
    Set {
        key: String,
        value: String,
        /// Value kind: bool, float, int, long, string or set (comma separated)
        #[arg(short, long, default_value = "string")]
        kind: ValueKind,
    },

    /// Remove a preference
    Unset {
        key: String,
    },

    /// List every preference
    List,

    /// Replicate this store across in-memory nodes sharing one PAN
    Simulate {
        /// Number of nodes, including the one seeded from this store
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// Debounce window in milliseconds (default: from config)
        #[arg(long)]
        debounce_ms: Option<u64>,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Get the default data directory (~/.prefsync/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".prefsync")
        .join("data")
}

/// Load the config file if given, then apply command-line overrides
fn load_config(path: Option<&Path>, store: Option<String>) -> Result<SyncConfig> {
    let mut config = match path {
        Some(path) => SyncConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(store) = store {
        config = config.with_store_name(store);
    }
    config.validate()?;
    Ok(config)
}

fn open_store(data_dir: &Path, config: &SyncConfig) -> Result<RedbStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;
    let path = data_dir.join(STORE_FILE);
    let store = RedbStore::open_named(&path, config.store_name.as_deref())
        .with_context(|| format!("Failed to open store at {}", path.display()))?;
    debug!(path = %path.display(), table = store.table_name(), "Opened store");
    Ok(store)
}

fn print_values(values: &BTreeMap<String, PrefValue>) {
    if values.is_empty() {
        println!("(no preferences)");
        return;
    }
    for (key, value) in values {
        println!("{} = {} ({})", key, value, value.kind());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let config = load_config(cli.config.as_deref(), cli.store)?;
    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let store = open_store(&data_dir, &config)?;

    match cli.command {
        Commands::Get { key } => match store.get(&key)? {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Preference '{}' is not set", key),
        },

        Commands::Set { key, value, kind } => {
            let value = PrefValue::parse(kind, &value)?;
            store.put(&key, value.clone())?;
            println!("Set {} = {}", key, value);
        }

        Commands::Unset { key } => {
            if !store.contains(&key)? {
                anyhow::bail!("Preference '{}' is not set", key);
            }
            store.remove(&key)?;
            println!("Removed {}", key);
        }

        Commands::List => {
            print_values(&store.get_all()?);
        }

        Commands::Simulate { nodes, debounce_ms } => {
            let config = match debounce_ms {
                Some(ms) => config.with_debounce_ms(ms),
                None => config,
            };
            simulate(&store, nodes, config).await?;
        }
    }

    Ok(())
}

/// Run `count` nodes on one in-memory PAN, copy the persistent store into
/// node 0 and wait until every node holds the same preferences.
async fn simulate(source: &RedbStore, count: usize, config: SyncConfig) -> Result<()> {
    if count < 2 {
        anyhow::bail!("Simulation needs at least 2 nodes (got {})", count);
    }

    let pan = MemoryPan::new();
    let mut nodes: Vec<(Arc<MemoryStore>, PrefSync)> = Vec::with_capacity(count);
    for i in 0..count {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(pan.transport_with_id(format!("node-{}", i)));
        let sync = PrefSync::new(store.clone(), transport, config.clone())?;
        sync.resume()?;
        nodes.push((store, sync));
    }
    info!(count, debounce_ms = config.debounce_ms, "Simulated nodes started");

    let mut values = source.get_all()?;
    values.remove(KEY_SYNC_DONE);
    if values.is_empty() {
        values.insert("simulate.greeting".to_string(), PrefValue::from("hello"));
    }
    let mut edits = StoreEdits::new();
    for (key, value) in &values {
        edits.put(key.clone(), value.clone());
    }
    println!("Editing node-0: {} preference(s)", edits.len());

    let started = Instant::now();
    nodes[0].0.commit(edits)?;

    loop {
        let converged = nodes.iter().all(|(store, _)| {
            store
                .get_all()
                .map(|mut all| {
                    all.remove(KEY_SYNC_DONE);
                    all == values
                })
                .unwrap_or(false)
        });
        if converged {
            break;
        }
        if started.elapsed() > CONVERGENCE_TIMEOUT {
            anyhow::bail!(
                "Nodes did not converge within {}s",
                CONVERGENCE_TIMEOUT.as_secs()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    println!(
        "Converged across {} nodes in {} ms",
        count,
        started.elapsed().as_millis()
    );
    for (i, (store, _)) in nodes.iter().enumerate() {
        println!();
        println!("node-{}:", i);
        print_values(&store.get_all()?);
    }

    for (_, sync) in nodes {
        sync.shutdown().await?;
    }
    Ok(())
}
