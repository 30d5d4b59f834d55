use clap::{Parser, Subcommand};
use seedrush::{
    registry::StateStore,
    wallet::{FundingClient, SharedWallet, UtxoIndexer, Wallet},
    ClientError, Config,
};

#[derive(Parser)]
struct Args {
    #[arg(short, long, help = "Verbose output")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the client wallet's address
    Address,

    /// Sync with the indexer and print the balance
    Balance,

    /// Ask the funding wallet to top up the client wallet
    Fund {
        #[arg(help = "Amount in satoshis")]
        amount: u64,
    },

    /// List saved torrents and what they earned and spent
    Torrents,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {

    let args = Args::parse();

    // Set up logging.
    seedrush::init_logging(if args.verbose { tracing::Level::DEBUG } else { tracing::Level::WARN });

    let config = Config::from_env().map_err(ClientError::from)?;

    match args.command {
        Command::Address => {
            let wallet = Wallet::load_or_create(&config.wallet_file, config.network)?;
            println!("{}", wallet.address());
        }

        Command::Balance => {
            let wallet = open_wallet(&config)?;
            wallet.sync(true).await?;
            let state = wallet.lock().await;
            println!("{} sats in {} outputs", state.balance(), state.utxos().len());
        }

        Command::Fund { amount } => {
            let wallet = open_wallet(&config)?;
            let funding = FundingClient::new(config.funding_url.clone(), config.funding_originator.clone());
            let utxo = funding.request_funds(wallet.locking_script(), amount).await?;
            println!("funded {} sats in tx {}", utxo.satoshis, utxo.txid);
        }

        Command::Torrents => {
            let store = StateStore::new(config.state_file.clone());
            let torrents = store.load().await?;
            if torrents.is_empty() {
                println!("no saved torrents in {}", store.path().display());
            }
            for t in torrents {
                let source = t
                    .seed_path
                    .map(|p| p.display().to_string())
                    .or(t.magnet_uri)
                    .unwrap_or_default();
                println!(
                    "{} {:<7} earned {} sats, spent {} sats  {}",
                    t.info_hash,
                    if t.is_paused { "paused" } else { "active" },
                    t.satoshis_earned,
                    t.satoshis_spent,
                    source,
                );
            }
        }
    }

    Ok(())
}

fn open_wallet(config: &Config) -> anyhow::Result<SharedWallet> {
    let wallet = Wallet::load_or_create(&config.wallet_file, config.network)?;
    Ok(SharedWallet::new(wallet, UtxoIndexer::new(config.indexer_url.clone()), config.sync_cooldown))
}
