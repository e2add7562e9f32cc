use thiserror::Error;

use satchel_chain::transaction;

/// Everything that can go wrong inside the wallet, surfaced at its public
/// operations.
#[derive(Error, Debug)]
pub enum WalletError {
    /// A secret failed to decrypt, or decrypted to garbage.
    #[error("wrong password")]
    WrongPassword,

    /// An address failed its checksum or is for the wrong network.
    #[error("invalid address: {0}")]
    InvalidAddress(&'static str),

    /// A seed (or key derived from one) is malformed.
    #[error("invalid seed: {0}")]
    InvalidSeed(&'static str),

    /// A new receiving address was requested while the trailing window of
    /// unused addresses is already at the gap limit.
    #[error("gap limit reached: use one of the existing unused addresses first")]
    GapLimitReached,

    /// Input selection cannot cover the requested amount plus fee.
    #[error("insufficient funds")]
    InsufficientFunds,

    /// A private key was requested for an address this wallet does not own.
    #[error("address not in this wallet")]
    UnknownAddress,

    /// The persisted wallet cannot be loaded.
    #[error("wallet store is corrupt: {reason}")]
    StoreCorrupt {
        /// What failed to load or validate.
        reason: String,
    },

    /// The server answered a request with an error.
    #[error("server error {code}: {message}")]
    Server {
        /// Server-assigned code, zero for bare-string errors.
        code: i64,
        /// The server's message.
        message: String,
    },

    /// A request was not answered in time.
    #[error("request timed out")]
    Timeout,

    /// The connection failed; the synchronizer retries these.
    #[error("network failure: {0}")]
    Transport(String),

    /// A Merkle branch did not hash to the stored header's root.
    #[error("merkle verification failed for {txid}")]
    Verification {
        /// The transaction whose proof failed.
        txid: transaction::Hash,
    },

    /// A filesystem error while reading or writing the wallet.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<satchel_network::Error> for WalletError {
    fn from(error: satchel_network::Error) -> Self {
        match error {
            satchel_network::Error::Timeout => WalletError::Timeout,
            satchel_network::Error::Server { code, message } => {
                WalletError::Server { code, message }
            }
            other => WalletError::Transport(other.to_string()),
        }
    }
}

impl WalletError {
    /// Whether the synchronizer should retry instead of surfacing this.
    pub fn is_transient(&self) -> bool {
        matches!(self, WalletError::Timeout | WalletError::Transport(_))
    }
}
