//! Onion client diagnostics
//!
//! Usage:
//!   onion-client bootstrap --seed https://seed1.example --data-dir ./onion-data
//!   onion-client paths --data-dir ./onion-data

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use onion_client::{HttpGuardProbe, JsonFileStore, OnionPathManager, SeedNodeClient, SnodePool};
use onion_core::{OnionConfig, PubKey, SeedUrl};

#[derive(Parser, Debug)]
#[command(name = "onion-client")]
#[command(about = "Bootstrap the snode pool and inspect onion paths")]
struct Args {
    /// JSON config file; defaults apply to missing fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch a fresh snode pool from seed nodes and persist it
    Bootstrap {
        /// Seed node URL (repeatable); overrides the configured seeds
        #[arg(long = "seed")]
        seeds: Vec<String>,

        #[arg(long, default_value = "onion-data")]
        data_dir: PathBuf,
    },
    /// Build onion paths from the persisted pool and print them
    Paths {
        #[arg(long, default_value = "onion-data")]
        data_dir: PathBuf,

        /// Probe guards with get_swarm for this public key before using them
        #[arg(long)]
        probe_pubkey: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => OnionConfig::load(path)?,
        None => OnionConfig::default(),
    };

    match args.command {
        Command::Bootstrap { seeds, data_dir } => {
            if !seeds.is_empty() {
                config.seed_urls = seeds.into_iter().map(SeedUrl::new).collect();
            }
            let store = Arc::new(JsonFileStore::open(&data_dir)?);
            let pool = SnodePool::new(&config, Arc::new(SeedNodeClient::new(&config)?), store);
            let count = pool.refresh_from_seed().await?;
            tracing::info!(count, data_dir = %data_dir.display(), "Snode pool saved");
            println!("{} service nodes", count);
        }
        Command::Paths {
            data_dir,
            probe_pubkey,
        } => {
            let store = Arc::new(JsonFileStore::open(&data_dir)?);
            let pool = Arc::new(SnodePool::new(
                &config,
                Arc::new(SeedNodeClient::new(&config)?),
                store.clone(),
            ));
            let loaded = pool.load().await?;
            tracing::info!(loaded, "Loaded snode pool");

            let mut paths = OnionPathManager::new(&config, pool, store);
            if let Some(pubkey) = probe_pubkey {
                paths = paths.with_guard_probe(Arc::new(HttpGuardProbe::new(PubKey::new(pubkey)?)?));
            }
            let paths = Arc::new(paths);
            paths.load_guards().await?;
            paths.build_paths().await?;

            for (slot, path) in paths.paths().iter().enumerate() {
                let hops: Vec<String> = path
                    .nodes
                    .iter()
                    .map(|n| format!("{}:{} {}", n.ip, n.port, n.key().short()))
                    .collect();
                println!("path {}: {}", slot, hops.join(" -> "));
            }
        }
    }

    Ok(())
}
