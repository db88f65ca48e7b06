// offcash CLI - mint demo tokens, pay and get paid over TCP

use clap::{Parser, Subcommand};
use offcash::ledger::{now_millis, DoubleSpendLedger, LedgerConfig, SharedLedger};
use offcash::logging::{init_logging, LogFormat};
use offcash::settlement::{OutboxSubmitter, Settler, SettlerConfig};
use offcash::storage::{SledTokenStore, TokenStore};
use offcash::token::{IssuerKeypair, IssuerPublicKey, TokenSigner, TokenVerifier};
use offcash::transfer::{OfflineTransfer, TransferConfig, TransferError, Wallet};
use offcash::transport::{PeerAddress, TcpTransport, TcpTransportConfig};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SERVICE_ID: &str = "offcash-transfer";

#[derive(Parser)]
#[command(name = "offcash", about = "Offline peer-to-peer cash transfers")]
struct Cli {
    /// Token store directory
    #[arg(long, default_value = "./offcash_data", env = "OFFCASH_STORE")]
    store: PathBuf,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info", env = "OFFCASH_LOG_LEVEL")]
    log_level: String,

    /// Emit JSON log lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a fresh issuer key pair
    Keygen,

    /// Mint signed tokens into the local store
    Issue {
        /// Issuer secret key (hex)
        #[arg(long, env = "OFFCASH_ISSUER_KEY")]
        issuer_key: String,
        /// Owner name the token ids derive from
        #[arg(long, default_value = "holder")]
        owner: String,
        /// Token amounts, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        amounts: Vec<i64>,
    },

    /// Show unspent total
    Balance,

    /// Wait for one payment
    Receive {
        /// Issuer public key (hex)
        #[arg(long, env = "OFFCASH_ISSUER")]
        issuer: String,
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        #[arg(long, default_value_t = 7400)]
        port: u16,
        /// Minimum amount to accept
        #[arg(long)]
        amount: Option<i64>,
        /// Seconds to wait for a sender
        #[arg(long, default_value_t = 120)]
        wait_secs: u64,
        /// Secret key (hex) to sign a settlement proposal with; none queued without it
        #[arg(long, env = "OFFCASH_SETTLE_KEY")]
        settle_key: Option<String>,
        /// Name this wallet settles under
        #[arg(long, default_value = "merchant")]
        name: String,
        /// Keep taking payments until interrupted
        #[arg(long)]
        keep_serving: bool,
    },

    /// Pay a listening receiver
    Send {
        /// Issuer public key (hex)
        #[arg(long, env = "OFFCASH_ISSUER")]
        issuer: String,
        /// Receiver address, host:port
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: i64,
    },

    /// Print double-spend ledger statistics
    Filter,

    /// Drop expired received-token records
    Cleanup,

    /// List settlement proposals waiting to go online
    Outbox,
}

fn parse_issuer(hex_key: &str) -> Result<TokenVerifier, Box<dyn Error>> {
    let bytes = hex::decode(hex_key)?;
    Ok(TokenVerifier::new(IssuerPublicKey::from_bytes(&bytes)?))
}

fn outbox(store_dir: &Path) -> OutboxSubmitter {
    OutboxSubmitter::new(store_dir.join("outbox.jsonl"))
}

fn open_ledger(store: Arc<dyn TokenStore>) -> Result<SharedLedger, Box<dyn Error>> {
    let ledger = DoubleSpendLedger::open(LedgerConfig::default(), store, now_millis())?;
    Ok(SharedLedger::new(ledger))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logging(LogFormat::from_json_flag(cli.json_logs), &cli.log_level)?;

    let sled_store = Arc::new(SledTokenStore::open(&cli.store)?);
    let store: Arc<dyn TokenStore> = sled_store.clone();

    match cli.command {
        Command::Keygen => {
            let keypair = IssuerKeypair::generate();
            println!("secret: {}", hex::encode(keypair.secret_bytes()));
            println!("public: {}", keypair.public_key().to_hex());
        }

        Command::Issue {
            issuer_key,
            owner,
            amounts,
        } => {
            let keypair = IssuerKeypair::from_secret_bytes(&hex::decode(issuer_key)?)?;
            let signer = TokenSigner::new(keypair);
            let base = now_millis();
            for (offset, amount) in amounts.into_iter().enumerate() {
                let token = signer.issue(&owner, amount, base + offset as i64);
                store.save(&token)?;
                println!("{} {}", token.id(), token.amount());
            }
            info!(balance = store.balance()?, "Tokens issued");
        }

        Command::Balance => {
            let stats = sled_store.stats()?;
            println!("balance: {}", store.balance()?);
            println!("unspent tokens: {} of {}", stats.unspent_count, stats.token_count);
        }

        Command::Receive {
            issuer,
            bind,
            port,
            amount,
            wait_secs,
            settle_key,
            name,
            keep_serving,
        } => {
            let settle_keypair = match settle_key {
                Some(key) => Some(IssuerKeypair::from_secret_bytes(&hex::decode(key)?)?),
                None => None,
            };
            let ledger = open_ledger(store.clone())?;
            let sweep_every = Duration::from_secs(ledger.lock().await.config().cleanup_interval_secs.max(1));
            let sweeper = ledger.spawn_cleanup_task(sweep_every);
            let wallet = Wallet::new(store.clone(), ledger, parse_issuer(&issuer)?);
            let config = TransferConfig::default().with_connect_timeout(Duration::from_secs(wait_secs));
            let mut settler = match settle_keypair {
                Some(keypair) => Some((Settler::new(SettlerConfig::default(), Arc::new(outbox(&cli.store)))?, keypair)),
                None => None,
            };

            let result = loop {
                let transfer = OfflineTransfer::new(wallet.clone(), config.clone());
                let mut transport =
                    TcpTransport::new(TcpTransportConfig::new().with_bind_address(&bind).with_bind_port(port));
                let address = transport.bind().await?;
                println!("listening on {}", address);

                let stop = transfer.stop_handle();
                let interrupt = tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        stop.stop();
                    }
                });
                let received = transfer.receive(&mut transport, SERVICE_ID, amount).await;
                interrupt.abort();

                let outcome = match received {
                    Ok(outcome) => outcome,
                    Err(TransferError::Cancelled) => break Ok(()),
                    Err(e) if keep_serving => {
                        warn!(error = %e, "Payment failed, listening again");
                        continue;
                    }
                    Err(e) => break Err(e),
                };
                println!("received {} in {} tokens", outcome.total_amount, outcome.tokens.len());

                if let Some((settler, keypair)) = settler.as_mut() {
                    match settler.settle_outcome(&outcome, keypair, &name).await {
                        Ok(receipt) => println!("queued for settlement as {}", receipt.transaction_id()),
                        Err(e) => warn!(error = %e, "Could not queue settlement proposal"),
                    }
                }
                if !keep_serving {
                    break Ok(());
                }
            };
            sweeper.abort();
            result?;
        }

        Command::Send { issuer, to, amount } => {
            let wallet = Wallet::new(store.clone(), open_ledger(store.clone())?, parse_issuer(&issuer)?);
            let transfer = OfflineTransfer::new(wallet, TransferConfig::default());
            let mut transport = TcpTransport::new(TcpTransportConfig::default());
            let address = PeerAddress::parse_tcp(&to)?;

            let outcome = transfer.send(&mut transport, &address, amount).await?;
            println!("paid {} with {} tokens", outcome.total_amount, outcome.tokens.len());
        }

        Command::Filter => {
            let ledger = open_ledger(store.clone())?;
            let stats = ledger.lock().await.statistics(now_millis());
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Command::Cleanup => {
            let ledger = open_ledger(store.clone())?;
            let report = ledger.cleanup_now().await?;
            println!(
                "removed {} expired, {} remaining{}",
                report.removed,
                report.remaining,
                if report.filter_reset { ", shared filter reset" } else { "" }
            );
        }

        Command::Outbox => {
            for proposal in outbox(&cli.store).pending().await? {
                println!("{}", serde_json::to_string(&proposal)?);
            }
        }
    }

    sled_store.flush()?;
    Ok(())
}
