//! Transparent (Bitcoin-inherited) transaction pieces: outpoints, inputs,
//! and outputs.

mod address;
mod script;
mod serialize;

pub use address::Address;
pub use script::Script;

use serde::{Deserialize, Serialize};

use crate::{amount::Amount, transaction};

/// The sequence number of an input that opts out of replacement.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// OutPoint
///
/// A particular transaction output reference.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    /// References the transaction that contains the output being spent.
    pub hash: transaction::Hash,

    /// Identifies which output of that transaction is referenced; the
    /// first output is 0, etc.
    pub index: u32,
}

impl OutPoint {
    /// Serialized length in bytes.
    #[inline]
    pub const fn len() -> usize {
        36
    }
}

/// A transparent input to a transaction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Input {
    /// The previous output being spent.
    pub outpoint: OutPoint,
    /// The script that authorizes spending `outpoint`.
    ///
    /// Empty until the transaction is signed; in a coinbase transaction it
    /// carries arbitrary miner data instead of a spending script.
    pub unlock_script: Script,
    /// The sequence number for the input.
    pub sequence: u32,
}

impl Input {
    /// Serialized length in bytes.
    pub fn len(&self) -> usize {
        OutPoint::len() + self.unlock_script.serialized_size() + 4
    }

    /// Whether this input has the null outpoint that marks a coinbase.
    pub fn is_coinbase(&self) -> bool {
        self.outpoint.hash == transaction::Hash([0; 32]) && self.outpoint.index == u32::MAX
    }
}

/// A transparent output from a transaction.
///
/// The funds a wallet "holds" are a set of unspent transaction outputs
/// locked to hashes of keys the wallet can derive.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Output {
    /// Transaction value.
    pub value: Amount,

    /// The lock script defines the conditions under which this output can
    /// be spent.
    pub lock_script: Script,
}

impl Output {
    /// Serialized length in bytes.
    pub fn len(&self) -> usize {
        8 + self.lock_script.serialized_size()
    }
}
