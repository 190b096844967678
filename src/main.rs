//! Braid node binary.
//!
//! Usage:
//!   braid keygen --datadir ./braid-data     # generate the PEM key
//!   braid run --datadir ./braid-data        # run a node (standalone app)
//!
//! `run` expects `<datadir>/peers.json` (a JSON array of
//! `{ "PubKeyHex": "...", "NetAddr": "..." }` with at least two entries) and
//! reads or creates `<datadir>/priv_key.pem`. With `--store` the poset is
//! persisted in `<datadir>/braid_db` and the node bootstraps from it on
//! restart.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;

use braid::crypto::Keypair;
use braid::node::{Node, NodeConfig};
use braid::peers::PeerSet;
use braid::poset::{InmemStore, SledStore, Store};
use braid::proxy::InmemApp;

/// Braid consensus node.
#[derive(Parser, Debug)]
#[command(name = "braid", version, about = "Leaderless BFT consensus over a gossiped event DAG")]
struct Cli {
    /// Data directory (key file, peers file, database).
    #[arg(long, default_value = "./braid-data", global = true)]
    datadir: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a private key in the data directory.
    Keygen,
    /// Run a node.
    Run {
        /// Listen address; defaults to this node's entry in peers.json.
        #[arg(long)]
        listen: Option<String>,

        /// Use the persistent store instead of the in-memory one.
        #[arg(long)]
        store: bool,

        /// Gossip heartbeat in milliseconds.
        #[arg(long, default_value_t = braid::constants::HEARTBEAT_MS)]
        heartbeat_ms: u64,

        /// Sync limit (events per sync before fast-forward kicks in).
        #[arg(long, default_value_t = braid::constants::SYNC_LIMIT)]
        sync_limit: i64,

        /// Event cache capacity.
        #[arg(long, default_value_t = braid::constants::CACHE_SIZE)]
        cache_size: usize,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result = match cli.command.unwrap_or(Command::Run {
        listen: None,
        store: false,
        heartbeat_ms: braid::constants::HEARTBEAT_MS,
        sync_limit: braid::constants::SYNC_LIMIT,
        cache_size: braid::constants::CACHE_SIZE,
    }) {
        Command::Keygen => keygen(&cli.datadir),
        Command::Run {
            listen,
            store,
            heartbeat_ms,
            sync_limit,
            cache_size,
        } => {
            run(
                &cli.datadir,
                listen,
                store,
                NodeConfig {
                    heartbeat: Duration::from_millis(heartbeat_ms),
                    sync_limit,
                    cache_size,
                    ..NodeConfig::default()
                },
            )
            .await
        }
    };

    if let Err(err) = result {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

fn keygen(datadir: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let path = Keypair::key_path(datadir);
    if path.exists() {
        return Err(format!("another key already lives at {}", path.display()).into());
    }
    let keypair = Keypair::load_or_generate(datadir)?;
    println!("public key: {}", keypair.public.to_hex());
    println!("key file:   {}", path.display());
    Ok(())
}

async fn run(
    datadir: &PathBuf,
    listen: Option<String>,
    persistent: bool,
    config: NodeConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let peers_path = datadir.join(braid::constants::PEERS_FILE);
    let participants = Arc::new(PeerSet::from_json_file(&peers_path)?);
    let keypair = Keypair::load_or_generate(datadir)?;

    let self_id = keypair.public.participant_id();
    let me = participants
        .by_id(self_id)
        .ok_or("our public key is not listed in peers.json")?;
    let listen_addr = listen.unwrap_or_else(|| me.net_addr.clone());

    let store: Box<dyn Store> = if persistent {
        let db_path = datadir.join(braid::constants::DB_DIR);
        Box::new(SledStore::new(&participants, config.cache_size, &db_path)?)
    } else {
        Box::new(InmemStore::new(&participants, config.cache_size))
    };

    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, id = self_id, "listening");

    // Standalone mode: the in-memory reference application consumes blocks.
    let (app, bridge) = InmemApp::start(config.commit_capacity, config.submit_capacity);

    let node = Arc::new(Node::new(
        config,
        keypair,
        participants,
        store,
        listener,
        bridge,
    )?);
    node.init().await?;
    node.clone().run_async(true);

    tokio::signal::ctrl_c().await?;
    tracing::info!(
        blocks = app.committed_blocks().len(),
        "interrupt received, stopping"
    );
    node.shutdown().await;
    Ok(())
}
