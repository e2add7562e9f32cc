//! The satchel command-line client.
//!
//! Thin glue over the wallet core: parse arguments, open or create the
//! wallet, run the synchronizer when a command needs fresh chain state,
//! and print results. Exit codes: 0 success, 1 wallet locked or invalid
//! input, 2 network failure, 3 insufficient funds.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::debug;

use satchel_chain::{
    amount::Amount,
    parameters::Network,
    transaction::Transaction,
    transparent::Address,
    BitcoinDeserialize, BitcoinSerialize,
};
use satchel_network::{Client, ClientConfig, ServerAddr};
use satchel_spv::{HeaderChain, Verifier};
use satchel_wallet::{Config, Seed, SharedWallet, Synchronizer, Wallet, WalletError};

const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "satchel", about = "A lightweight SPV Bitcoin wallet", version)]
struct Cli {
    /// Wallet file path.
    #[arg(short = 'w', long, default_value = "satchel.dat")]
    wallet: PathBuf,

    /// Indexer server as host:port; overrides the stored choice.
    #[arg(short = 's', long)]
    server: Option<String>,

    /// Fee per kilobyte in BTC.
    #[arg(short = 'f', long)]
    fee: Option<String>,

    /// Use the public test network.
    #[arg(long)]
    testnet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new wallet and print its seed.
    Create,
    /// Recreate a wallet from a seed and scan the chain for its history.
    Restore {
        /// The 32-hex-character seed.
        seed: String,
        /// Gap limit to scan with.
        #[arg(long)]
        gap_limit: Option<u32>,
    },
    /// Derive the next receiving address.
    Newaddress,
    /// Show the wallet balance, or the balance of specific addresses.
    Balance {
        addresses: Vec<String>,
    },
    /// Show the transaction history, oldest first.
    History,
    /// Create, sign, and broadcast a payment.
    Payto {
        /// Recipient address or label.
        to: String,
        /// Amount in BTC.
        amount: String,
        /// Optional label for the transaction.
        label: Vec<String>,
    },
    /// Create and sign a payment without broadcasting; print its hex.
    Mktx {
        /// Recipient address or label.
        to: String,
        /// Amount in BTC.
        amount: String,
    },
    /// Broadcast a signed transaction given as hex.
    Sendtx {
        raw: String,
    },
    /// Change or remove the wallet password.
    Password,
    /// Print the wallet seed. Password protected.
    Seed,
    /// Attach a label to an address or transaction id.
    Label {
        key: String,
        text: Vec<String>,
    },
    /// List wallet addresses.
    Addresses {
        /// Include change addresses.
        #[arg(short = 'a')]
        all: bool,
        /// Show per-address balances.
        #[arg(short = 'b')]
        balances: bool,
        /// Show private keys. Password protected.
        #[arg(short = 'k')]
        keys: bool,
    },
    /// List remembered outgoing addresses.
    Contacts,
    /// List other indexer servers known to the current one.
    Servers,
    /// Check an address's checksum and network.
    Validateaddress {
        address: String,
    },
    /// Import a standalone private key in WIF.
    Import {
        wif: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {}", error);
            ExitCode::from(exit_code(&error))
        }
    }
}

fn exit_code(error: &WalletError) -> u8 {
    match error {
        WalletError::InsufficientFunds => 3,
        WalletError::Timeout | WalletError::Transport(_) | WalletError::Server { .. } => 2,
        _ => 1,
    }
}

fn run(cli: Cli) -> Result<(), WalletError> {
    let mut config = Config::new(cli.wallet.clone());
    if cli.testnet {
        config.network = Network::Testnet;
    }
    if let Some(server) = &cli.server {
        config.server = server
            .parse::<ServerAddr>()
            .map_err(|_| WalletError::InvalidAddress("server must be host:port"))?;
        config.server_overridden = true;
    }
    if let Some(fee) = &cli.fee {
        config.fee_per_kb =
            Amount::from_btc_str(fee).ok_or(WalletError::InvalidAddress("bad fee amount"))?;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(dispatch(cli, config))
}

async fn dispatch(cli: Cli, config: Config) -> Result<(), WalletError> {
    match cli.command {
        Command::Create => create(config).await,
        Command::Restore { seed, gap_limit } => restore(config, seed, gap_limit).await,
        Command::Newaddress => newaddress(config).await,
        Command::Balance { addresses } => balance(config, addresses).await,
        Command::History => history(config),
        Command::Payto { to, amount, label } => {
            payto(config, to, amount, Some(label.join(" "))).await
        }
        Command::Mktx { to, amount } => mktx_cmd(config, to, amount),
        Command::Sendtx { raw } => sendtx(config, raw).await,
        Command::Password => password_cmd(config),
        Command::Seed => seed_cmd(config),
        Command::Label { key, text } => label_cmd(config, key, text.join(" ")),
        Command::Addresses { all, balances, keys } => addresses_cmd(config, all, balances, keys),
        Command::Contacts => contacts_cmd(config),
        Command::Servers => servers_cmd(config).await,
        Command::Validateaddress { address } => validate_address(config, address),
        Command::Import { wif } => import_cmd(config, wif).await,
    }
}

// ---- session plumbing ----

struct Session {
    wallet: SharedWallet,
    synchronizer: Synchronizer,
    client: Client,
}

/// Spawn the network client and verifier and wire them to the wallet.
fn open_session(config: &Config, wallet: Wallet) -> Result<Session, WalletError> {
    let server = wallet.server().clone();
    let shared: SharedWallet = Arc::new(Mutex::new(wallet));

    let (client, notifications) = Client::spawn(ClientConfig {
        server,
        client_version: CLIENT_VERSION.to_string(),
    });

    let chain = HeaderChain::load(config.network, config.headers_path.clone())
        .map_err(|error| WalletError::StoreCorrupt {
            reason: format!("headers file: {}", error),
        })?;
    let (request_tx, request_rx) = tokio::sync::mpsc::channel(256);
    let (event_tx, event_rx) = tokio::sync::mpsc::channel(256);
    tokio::spawn(Verifier::new(chain, client.clone()).run(request_rx, event_tx));

    let synchronizer = Synchronizer::new(
        shared.clone(),
        client.clone(),
        notifications,
        request_tx,
        event_rx,
    );
    Ok(Session {
        wallet: shared,
        synchronizer,
        client,
    })
}

fn open_wallet(config: &Config) -> Result<Wallet, WalletError> {
    match Wallet::open(config.clone()) {
        Ok(mut wallet) => {
            if config.server_overridden {
                wallet.set_server(config.server.clone());
            }
            Ok(wallet)
        }
        Err(WalletError::Io(error)) if error.kind() == std::io::ErrorKind::NotFound => {
            Err(WalletError::StoreCorrupt {
                reason: format!(
                    "wallet file not found at {}; run `satchel create` first",
                    config.wallet_path.display()
                ),
            })
        }
        Err(error) => Err(error),
    }
}

fn lock(shared: &SharedWallet) -> std::sync::MutexGuard<'_, Wallet> {
    shared.lock().expect("wallet mutex poisoned")
}

fn save(shared: &SharedWallet) -> Result<(), WalletError> {
    lock(shared).save()
}

// ---- prompts ----

fn prompt(text: &str) -> Result<String, WalletError> {
    eprint!("{}", text);
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn prompt_password(confirm: bool) -> Result<Option<String>, WalletError> {
    let first = prompt("Password (leave empty for none): ")?;
    if first.is_empty() {
        return Ok(None);
    }
    if confirm {
        let second = prompt("Confirm password: ")?;
        if first != second {
            return Err(WalletError::WrongPassword);
        }
    }
    Ok(Some(first))
}

/// Ask for the password only when the wallet actually has one.
fn required_password(wallet: &Wallet) -> Result<Option<String>, WalletError> {
    match wallet.check_password(None) {
        Ok(()) => Ok(None),
        Err(_) => {
            let entered = prompt("Password: ")?;
            let password = if entered.is_empty() { None } else { Some(entered) };
            wallet.check_password(password.as_deref())?;
            Ok(password)
        }
    }
}

fn parse_amount(text: &str) -> Result<Amount, WalletError> {
    Amount::from_btc_str(text).ok_or(WalletError::InvalidAddress("bad amount"))
}

fn parse_recipient(wallet: &Wallet, text: &str) -> Result<Address, WalletError> {
    if let Some(resolved) = wallet.resolve_label(text) {
        debug!(%resolved, alias = text, "resolved label to address");
        return Ok(resolved);
    }
    let address: Address = text
        .parse()
        .map_err(|_| WalletError::InvalidAddress("bad base58check address"))?;
    if !address.valid_for(wallet.network()) {
        return Err(WalletError::InvalidAddress("wrong network"));
    }
    Ok(address)
}

// ---- commands ----

async fn create(config: Config) -> Result<(), WalletError> {
    if config.wallet_path.exists() {
        return Err(WalletError::StoreCorrupt {
            reason: "remove the existing wallet first".to_string(),
        });
    }
    let password = prompt_password(true)?;
    let wallet = Wallet::create_new(config, None, password.as_deref())?;
    println!("Your seed is: {}", wallet.seed_hex(password.as_deref())?);
    println!("Please store it safely.");
    println!("First address: {}", wallet.receiving_addresses()[0]);
    wallet.save()
}

async fn restore(
    mut config: Config,
    seed: String,
    gap_limit: Option<u32>,
) -> Result<(), WalletError> {
    if config.wallet_path.exists() {
        return Err(WalletError::StoreCorrupt {
            reason: "remove the existing wallet first".to_string(),
        });
    }
    if let Some(gap_limit) = gap_limit {
        config.gap_limit = gap_limit;
    }
    let seed = Seed::from_hex(&seed)?;
    let password = prompt_password(true)?;
    let wallet = Wallet::create_new(config.clone(), Some(seed), password.as_deref())?;

    eprintln!("recovering wallet...");
    let mut session = open_session(&config, wallet)?;
    session.synchronizer.synchronize().await?;
    {
        let mut wallet = lock(&session.wallet);
        wallet.fill_addressbook();
        if wallet.is_found() {
            eprintln!("recovery successful");
        } else {
            eprintln!("no transactions found for this seed");
        }
    }
    save(&session.wallet)
}

async fn newaddress(config: Config) -> Result<(), WalletError> {
    let wallet = open_wallet(&config)?;
    let mut session = open_session(&config, wallet)?;
    session.synchronizer.synchronize().await?;
    let address = lock(&session.wallet).get_new_address()?;
    save(&session.wallet)?;
    println!("{}", address);
    Ok(())
}

async fn balance(config: Config, addresses: Vec<String>) -> Result<(), WalletError> {
    let wallet = open_wallet(&config)?;
    let mut session = open_session(&config, wallet)?;
    session.synchronizer.synchronize().await?;
    save(&session.wallet)?;

    let wallet = lock(&session.wallet);
    if addresses.is_empty() {
        let (confirmed, unconfirmed) = wallet.get_balance();
        if unconfirmed == Amount::ZERO {
            println!("{}", confirmed);
        } else {
            println!("{} {}", confirmed, unconfirmed);
        }
        return Ok(());
    }
    for text in addresses {
        let address: Address = text
            .parse()
            .map_err(|_| WalletError::InvalidAddress("bad base58check address"))?;
        let (confirmed, unconfirmed) = wallet.get_addr_balance(&address);
        if unconfirmed == Amount::ZERO {
            println!("{} {}", address, confirmed);
        } else {
            println!("{} {}, {}", address, confirmed, unconfirmed);
        }
    }
    Ok(())
}

fn history(config: Config) -> Result<(), WalletError> {
    let wallet = open_wallet(&config)?;
    let mut running = Amount::ZERO;
    for item in wallet.transaction_history() {
        running = running.checked_add(item.value).unwrap_or(running);
        let when = match Utc.timestamp_opt(item.timestamp as i64, 0).single() {
            Some(time) if item.timestamp > 0 => time.format("%Y-%m-%d %H:%M").to_string(),
            _ => "pending".to_string(),
        };
        let what = item.label.unwrap_or_else(|| item.txid.to_string());
        let sign = if item.value.is_negative() { "" } else { "+" };
        println!("{}  {:<64}  {}{}  {}", when, what, sign, item.value, running);
    }
    println!("# balance: {}", running);
    Ok(())
}

async fn payto(
    config: Config,
    to: String,
    amount: String,
    label: Option<String>,
) -> Result<(), WalletError> {
    let wallet = open_wallet(&config)?;
    let password = required_password(&wallet)?;
    let amount = parse_amount(&amount)?;

    let mut session = open_session(&config, wallet)?;
    session.synchronizer.synchronize().await?;

    let tx = {
        let mut wallet = lock(&session.wallet);
        let recipient = parse_recipient(&wallet, &to)?;
        let label = label.filter(|text| !text.is_empty());
        wallet.mktx(
            &recipient,
            amount,
            None,
            password.as_deref(),
            label.as_deref(),
        )?
    };
    let txid = session.synchronizer.broadcast(&tx).await?;
    save(&session.wallet)?;
    println!("{}", txid);
    Ok(())
}

fn mktx_cmd(config: Config, to: String, amount: String) -> Result<(), WalletError> {
    let mut wallet = open_wallet(&config)?;
    let password = required_password(&wallet)?;
    let amount = parse_amount(&amount)?;
    let recipient = parse_recipient(&wallet, &to)?;

    let tx = wallet.mktx(&recipient, amount, None, password.as_deref(), None)?;
    wallet.save()?;
    let raw = tx
        .bitcoin_serialize_to_vec()
        .expect("serializing to a Vec never fails");
    println!("{}", hex::encode(raw));
    Ok(())
}

async fn sendtx(config: Config, raw: String) -> Result<(), WalletError> {
    let bytes = hex::decode(raw.trim())
        .map_err(|_| WalletError::InvalidAddress("transaction is not hex"))?;
    let tx = Transaction::bitcoin_deserialize(&bytes[..])
        .map_err(|_| WalletError::InvalidAddress("transaction does not parse"))?;

    let wallet = open_wallet(&config)?;
    let mut session = open_session(&config, wallet)?;
    let txid = session.synchronizer.broadcast(&tx).await?;
    println!("{}", txid);
    Ok(())
}

fn password_cmd(config: Config) -> Result<(), WalletError> {
    let mut wallet = open_wallet(&config)?;
    let old = required_password(&wallet)?;
    let new = prompt_password(true)?;
    wallet.change_password(old.as_deref(), new.as_deref())
}

fn seed_cmd(config: Config) -> Result<(), WalletError> {
    let wallet = open_wallet(&config)?;
    let password = required_password(&wallet)?;
    println!("{}", wallet.seed_hex(password.as_deref())?);
    Ok(())
}

fn label_cmd(config: Config, key: String, text: String) -> Result<(), WalletError> {
    let mut wallet = open_wallet(&config)?;
    wallet.set_label(&key, &text);
    wallet.save()
}

fn addresses_cmd(
    config: Config,
    all: bool,
    balances: bool,
    keys: bool,
) -> Result<(), WalletError> {
    let wallet = open_wallet(&config)?;
    let password = if keys {
        required_password(&wallet)?
    } else {
        None
    };

    for address in wallet.all_addresses() {
        let is_change = wallet.is_change(&address);
        if is_change && !all {
            continue;
        }
        let mut line = address.to_string();
        if keys {
            let secret = wallet.get_private_key(&address, password.as_deref())?;
            line = format!(
                "{}:{}",
                line,
                satchel_wallet::keys::wif_encode(&secret, wallet.network())
            );
        }
        if balances {
            let (confirmed, _) = wallet.get_addr_balance(&address);
            line = format!("{} {}", line, confirmed);
        }
        let mut tag = "";
        if is_change {
            tag = "[change]";
        }
        if wallet.imported_addresses().contains(&address) {
            tag = "[imported]";
        }
        let label = wallet.label(&address.to_string()).unwrap_or("");
        println!("{} {} {}", line, tag, label);
    }
    Ok(())
}

fn contacts_cmd(config: Config) -> Result<(), WalletError> {
    let wallet = open_wallet(&config)?;
    for address in wallet.contacts() {
        let label = wallet.label(&address.to_string()).unwrap_or("");
        println!("{} {}", address, label);
    }
    Ok(())
}

async fn servers_cmd(config: Config) -> Result<(), WalletError> {
    let wallet = open_wallet(&config)?;
    let session = open_session(&config, wallet)?;
    for peer in session.client.peers().await? {
        let host = if peer.hostname.is_empty() {
            &peer.ip
        } else {
            &peer.hostname
        };
        println!("{} {}", host, peer.features.join(" "));
    }
    Ok(())
}

fn validate_address(config: Config, address: String) -> Result<(), WalletError> {
    let valid = address
        .parse::<Address>()
        .map(|parsed| parsed.valid_for(config.network))
        .unwrap_or(false);
    println!("{}", valid);
    Ok(())
}

async fn import_cmd(config: Config, wif: String) -> Result<(), WalletError> {
    let wallet = open_wallet(&config)?;
    let password = required_password(&wallet)?;

    let mut session = open_session(&config, wallet)?;
    let address = lock(&session.wallet).import_key(&wif, password.as_deref())?;
    session.synchronizer.synchronize().await?;
    save(&session.wallet)?;
    println!("keypair imported: {}", address);
    Ok(())
}
