//! The satchel wallet core: deterministic keys, encrypted persistence,
//! balance and UTXO accounting, transaction construction, and the
//! synchronization engine that keeps it all matched to the chain through
//! an untrusted indexer server.

pub mod config;
pub mod encryption;
mod error;
pub mod keys;
pub mod store;
pub mod sync;
pub mod wallet;

pub use config::Config;
pub use error::WalletError;
pub use keys::Seed;
pub use sync::{SharedWallet, Synchronizer};
pub use wallet::{HistoryItem, Unspent, Wallet};
