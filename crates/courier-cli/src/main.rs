//! Courier CLI
//!
//! Thin wrapper around courier-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Create an identity key file
//! courier identity new --out ~/.courier/identity.key
//!
//! # Show the fingerprint of a key file
//! courier identity show ~/.courier/identity.key
//!
//! # Print the effective transport configuration
//! courier config --file transport.json
//!
//! # Run two in-process nodes and deliver a message on each tier
//! courier demo
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use courier_core::{
    DeliveryOutcome, DilithiumIdentity, DilithiumVerifier, FnHandler, InboundMessage, ManualClock,
    MemoryDht, Signer, Storage, Transport, TransportConfig, TransportDeps,
};
use tokio::sync::mpsc;

/// Courier - P2P message delivery
#[derive(Parser)]
#[command(name = "courier")]
#[command(version = "0.1.0")]
#[command(about = "Courier - P2P message delivery over a DHT")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.courier)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Print the effective transport configuration
    Config {
        /// JSON file with overrides
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Run two in-process nodes and deliver messages between them
    Demo,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Generate a new identity
    New {
        /// Key file to write (default: <data-dir>/identity.key)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Replace an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Show the fingerprint of a key file
    Show {
        /// Key file to read (default: <data-dir>/identity.key)
        path: Option<PathBuf>,
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

/// Get the default data directory (~/.courier)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".courier")
}

fn load_identity(path: &Path) -> Result<DilithiumIdentity> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading identity from {}", path.display()))?;
    Ok(DilithiumIdentity::from_bytes(&bytes)?)
}

fn identity_new(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to replace it)", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let identity = DilithiumIdentity::generate();
    std::fs::write(path, identity.to_bytes())
        .with_context(|| format!("writing identity to {}", path.display()))?;

    println!("Identity created");
    println!("  File: {}", path.display());
    println!("  Fingerprint: {}", identity.fingerprint());
    Ok(())
}

fn identity_show(path: &Path) -> Result<()> {
    let identity = load_identity(path)?;
    let public_key = identity.public_key();
    println!("Identity");
    println!("  File: {}", path.display());
    println!("  Fingerprint: {}", identity.fingerprint());
    println!("  Short: {}", identity.fingerprint().short());
    println!("  Public key: {} bytes ({}...)", public_key.len(), hex::encode(&public_key[..8.min(public_key.len())]));
    Ok(())
}

fn show_config(file: Option<&Path>) -> Result<()> {
    let config = match file {
        Some(path) => TransportConfig::load(path)?,
        None => TransportConfig::default(),
    };
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

struct DemoNode {
    name: &'static str,
    transport: Arc<Transport>,
    inbox: mpsc::UnboundedReceiver<InboundMessage>,
}

fn demo_node(name: &'static str, dht: &Arc<MemoryDht>, clock: &ManualClock) -> Result<DemoNode> {
    let (tx, inbox) = mpsc::unbounded_channel();
    let config = TransportConfig {
        listen_port: 0,
        enable_ice: false,
        advertise_addresses: vec!["127.0.0.1".to_string()],
        ..Default::default()
    };
    let transport = Transport::new(
        config,
        TransportDeps {
            dht: dht.clone(),
            signer: Arc::new(DilithiumIdentity::generate()),
            verifier: Arc::new(DilithiumVerifier),
            storage: Storage::in_memory()?,
            clock: Arc::new(clock.clone()),
        },
        Arc::new(FnHandler(move |message: InboundMessage| {
            let _ = tx.send(message);
        })),
    )?;
    println!("{:>5}: {}", name, transport.local_fingerprint().short());
    Ok(DemoNode {
        name,
        transport,
        inbox,
    })
}

fn describe(outcome: DeliveryOutcome) -> String {
    match outcome {
        DeliveryOutcome::Direct => "delivered directly over TCP".to_string(),
        DeliveryOutcome::NatTraversal => "delivered over ICE".to_string(),
        DeliveryOutcome::QueuedOffline { seq } => format!("queued offline as seq {}", seq),
    }
}

async fn receive(node: &mut DemoNode) -> Result<InboundMessage> {
    tokio::time::timeout(std::time::Duration::from_secs(5), node.inbox.recv())
        .await
        .context("timed out waiting for delivery")?
        .context("dispatcher stopped")
}

async fn demo() -> Result<()> {
    let clock = ManualClock::starting_now();
    let dht = Arc::new(MemoryDht::new(Arc::new(clock.clone())));

    println!("Nodes");
    let alice = demo_node("alice", &dht, &clock)?;
    let mut bob = demo_node("bob", &dht, &clock)?;
    let alice_fp = alice.transport.local_fingerprint();
    let bob_fp = bob.transport.local_fingerprint();
    alice.transport.start().await?;
    println!();

    println!("1. {} sends while {} is offline", alice.name, bob.name);
    let outcome = alice
        .transport
        .send(&bob_fp, Bytes::from_static(b"are you there?"))
        .await?;
    println!("   {}", describe(outcome));

    println!("2. {} comes online and polls its contacts", bob.name);
    bob.transport.start().await?;
    let collected = bob.transport.check_offline_messages(&[alice_fp]).await?;
    let message = receive(&mut bob).await?;
    println!(
        "   collected {} message(s): {:?} (seq {:?})",
        collected,
        String::from_utf8_lossy(&message.ciphertext),
        message.seq_num
    );

    bob.transport.tasks().wait_idle().await;
    let pruned = alice.transport.spillway().maintain().await?;
    println!("   {} pruned {} delivered entr(ies) from its outbox", alice.name, pruned);

    println!("3. {} sends again now that {} is online", alice.name, bob.name);
    let outcome = alice
        .transport
        .send(&bob_fp, Bytes::from_static(b"hello directly"))
        .await?;
    println!("   {}", describe(outcome));
    let message = receive(&mut bob).await?;
    println!("   {} received {:?} via {:?}", bob.name, String::from_utf8_lossy(&message.ciphertext), message.via);

    println!();
    println!("Stats");
    println!("  {}: {}", alice.name, serde_json::to_string(&alice.transport.stats())?);
    println!("  {}: {}", bob.name, serde_json::to_string(&bob.transport.stats())?);

    alice.transport.shutdown().await;
    bob.transport.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let default_key = data_dir.join("identity.key");

    match cli.command {
        Commands::Identity { action } => match action {
            IdentityAction::New { out, force } => {
                identity_new(&out.unwrap_or(default_key), force)?;
            }
            IdentityAction::Show { path } => {
                identity_show(&path.unwrap_or(default_key))?;
            }
        },
        Commands::Config { file } => show_config(file.as_deref())?,
        Commands::Demo => demo().await?,
    }

    Ok(())
}
