//! Quorum Signer CLI
//!
//! Command-line interface for a federated signet:
//! - Key and descriptor setup
//! - PSBT generation, signing and combining
//! - Solution extraction and block finishing
//! - Signing rounds over the relay network

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Block, Network, NetworkKind};
use clap::{Parser, Subcommand};
use psbt_relay::SignetPsbtMessage;
use psbt_relay_client::RelayClient;
use quorum_core::signet::{self, signet_magic};
use quorum_core::solution::{self, SignetSolution};
use quorum_core::types::parse_key_file;
use quorum_core::{
    LocalSigner, PsbtSigner, QuorumBuilder, QuorumDescriptor, SignerKeyPair, SigningRound,
    DEFAULT_SIGNERS, DEFAULT_THRESHOLD,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, Level};

/// Quorum Signer - federated signet signer
#[derive(Parser)]
#[command(name = "quorum-signer")]
#[command(about = "M-of-N taproot quorum signer for signet blocks")]
#[command(version)]
struct Cli {
    /// Relay service URL
    #[arg(short, long, env = "RELAY_URL", default_value = "http://127.0.0.1:8080")]
    relay: String,

    /// Data directory for key files and descriptors
    #[arg(short, long, env = "DEST", default_value = "./data")]
    dest: PathBuf,

    /// Quorum descriptor (may hold this signer's private key)
    #[arg(long, env = "SIGNER_DESCRIPTOR")]
    descriptor: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate key pairs for the internal key and every signer
    Keygen {
        /// Number of multi_a signers
        #[arg(short, long, default_value_t = DEFAULT_SIGNERS)]
        n: usize,
    },

    /// Build the quorum descriptor and per-signer views from a key file
    Descriptor {
        /// Threshold (M-of-N)
        #[arg(short, long, default_value_t = DEFAULT_THRESHOLD)]
        t: usize,

        /// Key file (defaults to <dest>/keys.json)
        #[arg(short, long)]
        keys: Option<PathBuf>,
    },

    /// Create the PSBT authorizing a block
    Genpsbt {
        /// Block (hex or path to a hex file)
        #[arg(short, long)]
        block: String,
    },

    /// Add this signer's signature to a PSBT
    Sign {
        /// PSBT (base64 or path to a base64 file)
        #[arg(short, long)]
        psbt: String,
    },

    /// Merge partially signed PSBTs
    Combine {
        /// PSBTs (base64 or paths)
        #[arg(required = true)]
        psbts: Vec<String>,
    },

    /// Extract the signet solution of a signed PSBT
    Solution {
        #[arg(short, long)]
        psbt: String,
    },

    /// Embed the solution of a signed PSBT into its block
    Embed {
        #[arg(short, long)]
        block: String,

        #[arg(short, long)]
        psbt: String,
    },

    /// Run a signing round for a block over the relay network
    Relay {
        #[arg(short, long)]
        block: String,

        /// Seconds to wait for signatures
        #[arg(long, default_value = "60")]
        timeout: u64,
    },

    /// Show descriptor info
    Info,
}

/// Descriptor setup written by `descriptor`
#[derive(Debug, Serialize, Deserialize)]
struct QuorumInfo {
    descriptor: String,
    threshold: usize,
    signers: usize,
    challenge: String,
    address: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Keygen { n } => {
            run_keygen(&cli, *n)?;
        }
        Commands::Descriptor { t, keys } => {
            run_descriptor(&cli, *t, keys.as_deref())?;
        }
        Commands::Genpsbt { block } => {
            let descriptor = load_descriptor(&cli)?;
            let psbt = signet::signet_psbt(&read_block(block)?, descriptor.challenge())?;
            println!("{}", encode_psbt(&psbt));
        }
        Commands::Sign { psbt } => {
            println!("{}", encode_psbt(&run_sign(&load_descriptor(&cli)?, &read_psbt(psbt)?)?));
        }
        Commands::Combine { psbts } => {
            run_combine(&load_descriptor(&cli)?, psbts)?;
        }
        Commands::Solution { psbt } => {
            let descriptor = load_descriptor(&cli)?;
            let section = solution::extract_solution(&read_psbt(psbt)?, &descriptor.quorum())?;
            println!("{}", hex::encode(section));
        }
        Commands::Embed { block, psbt } => {
            let block = run_embed(&load_descriptor(&cli)?, read_block(block)?, &read_psbt(psbt)?)?;
            println!("{}", hex::encode(serialize(&block)));
        }
        Commands::Relay { block, timeout } => {
            run_relay(&cli, read_block(block)?, Duration::from_secs(*timeout)).await?;
        }
        Commands::Info => {
            show_info(&load_descriptor(&cli)?);
        }
    }

    Ok(())
}

fn run_keygen(cli: &Cli, n: usize) -> Result<()> {
    std::fs::create_dir_all(&cli.dest)?;
    let secp = Secp256k1::new();

    info!(signers = n, "Generating key pairs");

    let keys = (0..=n)
        .map(|_| {
            let xpriv = Xpriv::new_master(NetworkKind::Test, &rand::random::<[u8; 32]>())?;
            let xpub = Xpub::from_priv(&secp, &xpriv);
            Ok(SignerKeyPair::with_private(
                format!("{}/0", xpriv),
                format!("{}/0", xpub),
            ))
        })
        .collect::<Result<Vec<_>>>()?;

    let path = cli.dest.join("keys.json");
    std::fs::write(&path, serde_json::to_string_pretty(&keys)?)?;

    info!(path = ?path, "Key pairs saved");
    println!("Generated {} key pairs (internal key + {} signers)", keys.len(), n);

    Ok(())
}

fn run_descriptor(cli: &Cli, threshold: usize, keys: Option<&Path>) -> Result<()> {
    let keys_path = keys.map(Path::to_path_buf).unwrap_or_else(|| cli.dest.join("keys.json"));
    let keys = parse_key_file(&std::fs::read_to_string(&keys_path)?)?;

    let (descriptor, challenge) = QuorumBuilder::build(&keys, threshold)?;
    let info = QuorumInfo {
        descriptor: descriptor.as_str().to_string(),
        threshold,
        signers: keys.len() - 1,
        challenge: hex::encode(challenge.as_bytes()),
        address: descriptor.address(Network::Signet).to_string(),
    };

    std::fs::create_dir_all(&cli.dest)?;
    std::fs::write(cli.dest.join("quorum.json"), serde_json::to_string_pretty(&info)?)?;
    for view in QuorumBuilder::signer_views(&keys, threshold)? {
        let path = cli.dest.join(format!("signer.{}.descriptor", view.slot.key_index()));
        std::fs::write(&path, &view.descriptor)?;
    }

    println!("Descriptor: {}", info.descriptor);
    println!("Challenge: {}", info.challenge);
    println!("Address: {}", info.address);

    Ok(())
}

fn run_sign(descriptor: &QuorumDescriptor, psbt: &Psbt) -> Result<Psbt> {
    let signer = LocalSigner::from_descriptor(descriptor)?;
    let signed = signer.sign_psbt(psbt)?;
    info!(slot = %signer.slot(), "PSBT signed");
    Ok(signed)
}

fn run_combine(descriptor: &QuorumDescriptor, psbts: &[String]) -> Result<()> {
    let mut psbts = psbts.iter().map(|p| read_psbt(p));
    let first = psbts.next().ok_or_else(|| anyhow!("no PSBT given"))??;

    let mut round = SigningRound::new(descriptor.quorum(), first)?;
    for psbt in psbts {
        round.merge(&psbt?)?;
    }

    info!(state = ?round.state(), signatures = round.signature_count(), "PSBTs combined");
    println!("{}", encode_psbt(round.psbt()));

    Ok(())
}

fn run_embed(descriptor: &QuorumDescriptor, mut block: Block, psbt: &Psbt) -> Result<Block> {
    let solution = SignetSolution::from_psbt(psbt, &descriptor.quorum())?;
    signet::embed_solution(&mut block, &solution)?;
    info!(block_hash = %block.block_hash(), "Block finished");
    Ok(block)
}

async fn run_relay(cli: &Cli, block: Block, timeout: Duration) -> Result<()> {
    let descriptor = load_descriptor(cli)?;
    let client = RelayClient::new(&cli.relay);

    let mut psbt = signet::signet_psbt(&block, descriptor.challenge())?;
    let mut message = SignetPsbtMessage::initiate(&psbt, &block);
    if descriptor.local_slot().is_some() {
        let signer = LocalSigner::from_descriptor(&descriptor)?;
        psbt = signer.sign_psbt(&psbt)?;
        message = message.resigned(&psbt, vec![signer.short_id(message.nonce)]);
    }

    let mut round = SigningRound::new(descriptor.quorum(), psbt)?;
    let mut subscription = client.subscribe(signet_magic(descriptor.challenge())).await?;
    let submitted = client.submit(&message).await?;

    info!(
        nonce = message.nonce,
        accepted = submitted.accepted,
        forwarded = submitted.forwarded,
        "Signing round started"
    );

    if !round.is_complete() {
        subscription
            .collect_round(&mut round, message.nonce, timeout)
            .await?;
    }

    let block = run_embed(&descriptor, block, round.psbt())?;
    info!(signatures = round.signature_count(), "Signing round complete");
    println!("{}", hex::encode(serialize(&block)));

    Ok(())
}

fn show_info(descriptor: &QuorumDescriptor) {
    let quorum = descriptor.quorum();

    println!("Quorum Info:");
    println!("  Threshold: {}", quorum.threshold());
    println!("  Signers: {}", quorum.signers().len());
    println!("  Internal Key: {}", quorum.internal_key());
    println!("  Challenge: {}", hex::encode(quorum.challenge().as_bytes()));
    println!("  Address: {}", quorum.address(Network::Signet));
    println!("  Magic: {}", signet_magic(quorum.challenge()));
    match descriptor.local_slot() {
        Some(slot) => println!("  Local Signer: {}", slot),
        None => println!("  Local Signer: none"),
    }
}

fn load_descriptor(cli: &Cli) -> Result<QuorumDescriptor> {
    match &cli.descriptor {
        Some(text) => Ok(QuorumDescriptor::parse(&read_input(text)?)?),
        None => {
            let json = std::fs::read_to_string(cli.dest.join("quorum.json"))
                .context("no --descriptor given and no quorum.json in the data directory")?;
            let info: QuorumInfo = serde_json::from_str(&json)?;
            Ok(QuorumDescriptor::parse(&info.descriptor)?)
        }
    }
}

/// The argument itself, or the contents of the file it names
fn read_input(arg: &str) -> Result<String> {
    let path = Path::new(arg);
    if path.is_file() {
        return Ok(std::fs::read_to_string(path)?.trim().to_string());
    }
    Ok(arg.trim().to_string())
}

fn read_block(arg: &str) -> Result<Block> {
    let bytes = hex::decode(read_input(arg)?).context("block must be hex encoded")?;
    Ok(deserialize(&bytes)?)
}

fn read_psbt(arg: &str) -> Result<Psbt> {
    let bytes = STANDARD
        .decode(read_input(arg)?)
        .context("PSBT must be base64 encoded")?;
    Ok(Psbt::deserialize(&bytes)?)
}

fn encode_psbt(psbt: &Psbt) -> String {
    STANDARD.encode(psbt.serialize())
}
