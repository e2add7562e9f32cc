//! Runtime configuration, passed to `Wallet::create_new` and `Wallet::open`
//! instead of living in globals.

use std::path::PathBuf;

use satchel_chain::{amount::Amount, parameters::Network};
use satchel_network::ServerAddr;

/// Servers tried when the user has not chosen one.
pub const DEFAULT_SERVERS: &[&str] = &["ecdsa.org", "electrum.novit.ro"];

/// The default port, which selects the persistent JSON-RPC transport.
pub const DEFAULT_PORT: u16 = 50001;

/// Default fee rate: 0.001 BTC per kilobyte of transaction.
pub const DEFAULT_FEE_PER_KB: Amount = Amount::from_sat(100_000);

/// Default number of trailing unused receiving addresses to maintain.
pub const DEFAULT_GAP_LIMIT: u32 = 5;

/// Wallet-wide configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Where the wallet record lives.
    pub wallet_path: PathBuf,
    /// Where the header chain is mirrored.
    pub headers_path: PathBuf,
    /// Which Bitcoin network the wallet is on.
    pub network: Network,
    /// The indexer server to use when the wallet record does not name one.
    pub server: ServerAddr,
    /// When set, `server` was chosen explicitly and replaces the stored
    /// endpoint instead of merely seeding fresh wallets.
    pub server_overridden: bool,
    /// Gap limit for fresh wallets.
    pub gap_limit: u32,
    /// Fee rate for fresh wallets.
    pub fee_per_kb: Amount,
}

impl Config {
    /// A configuration rooted at `wallet_path` with stock defaults.
    pub fn new(wallet_path: PathBuf) -> Config {
        let headers_path = wallet_path.with_extension("headers");
        Config {
            wallet_path,
            headers_path,
            network: Network::Mainnet,
            server: ServerAddr::new(DEFAULT_SERVERS[0], DEFAULT_PORT),
            server_overridden: false,
            gap_limit: DEFAULT_GAP_LIMIT,
            fee_per_kb: DEFAULT_FEE_PER_KB,
        }
    }
}
