use clap::{Parser, Subcommand};

use dotenvy::dotenv;
use std::env;
use std::io::Write;
use std::str::FromStr;

use log::{debug, LevelFilter};
use serde::{Deserialize, Serialize};

use anyhow::{bail, Context, Result};
use bitcoin::{Network, OutPoint, PrivateKey};
use secp256k1::SecretKey;

use joinmix::commitments::PodleStore;
use joinmix::podle::{
    commitment_from_wire, deserialize_revelation, generate_single, verify_podle,
};

/// Operator tooling for the joinmix commitment store
#[derive(Parser, Debug, Serialize, Deserialize)]
#[command(name = "joinmix")]
#[command(version = "0.1")]
#[command(about, long_about = None)]
struct Cli {
    /// Commitment store file (defaults to $COMMITMENTS_FILE or
    /// ./commitments.json)
    #[arg(short, long)]
    commitments_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, Serialize, Deserialize)]
enum Commands {
    /// Show used and external commitments in the store
    ListCommitments,
    /// Precompute commitments for an external utxo and add them to the
    /// store, for takers whose wallet coins are all too new or too small
    AddCommitment {
        /// The utxo as txid:vout
        #[arg(long)]
        utxo: String,
        /// Hex private key controlling the utxo
        #[arg(long)]
        priv_key: String,
        /// How many NUMS indices to precompute
        #[arg(long, default_value_t = 3)]
        tries: u8,
        /// bitcoin, testnet, signet or regtest
        #[arg(long, default_value = "bitcoin")]
        network: String,
    },
    /// Check a commitment opening as a maker would
    VerifyRevelation {
        /// Wire commitment (type byte plus hash)
        #[arg(long)]
        commitment: String,
        /// The opening, txid:vout|P|P2|sig|e
        #[arg(long)]
        revelation: String,
        #[arg(long, default_value_t = 3)]
        retries: u8,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{}:{} {} [{}] - {}",
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                chrono::Local::now().format("%Y-%m-%dT%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(Some("joinmix"), LevelFilter::Debug)
        .init();
    let args: Cli = Cli::parse();
    dotenv().ok();

    let store_path = match args.commitments_file {
        Some(path) => path,
        None => env::var("COMMITMENTS_FILE").unwrap_or_else(|_| "commitments.json".to_string()),
    };
    debug!("using commitment store at {}", store_path);
    let store = PodleStore::new(store_path);

    match &args.command {
        Commands::ListCommitments => {
            let (used, external) = store.entries()?;
            println!("{} used commitments:", used.len());
            for commit in used {
                println!("  {}", commit);
            }
            println!("{} external commitments:", external.len());
            for (commit, entry) in external {
                println!(
                    "  {} utxo={} used={}",
                    commit, entry.utxo, entry.used
                );
            }
        }
        Commands::AddCommitment {
            utxo,
            priv_key,
            tries,
            network,
        } => {
            let network = match network.as_str() {
                "bitcoin" | "mainnet" => Network::Bitcoin,
                "testnet" => Network::Testnet,
                "signet" => Network::Signet,
                "regtest" => Network::Regtest,
                other => bail!("unknown network {}", other),
            };
            let secret = SecretKey::from_slice(&hex::decode(priv_key)?)
                .context("invalid private key")?;
            let key = PrivateKey::new(secret, network);
            let outpoint = OutPoint::from_str(utxo).context("utxo must be txid:vout")?;
            for index in 0..*tries {
                let auth = generate_single(&key, outpoint, index)?;
                store.add_external(&auth)?;
                println!("added commitment {} (index {})", auth.commit, index);
            }
        }
        Commands::VerifyRevelation {
            commitment,
            revelation,
            retries,
        } => {
            let commit = commitment_from_wire(commitment)?;
            let auth = deserialize_revelation(revelation)?;
            match verify_podle(&auth, &commit, 0..*retries) {
                Ok(()) => println!("valid: utxo {} opens the commitment", auth.utxo),
                Err(e) => bail!("verification failed: {}", e),
            }
        }
    }
    Ok(())
}
