//! Core Bitcoin data types for the satchel wallet: consensus wire
//! serialization, satoshi amounts, scripts and addresses, transactions,
//! and block headers.
//!
//! Everything that crosses the Bitcoin wire format lives here, behind the
//! `BitcoinSerialize` and `BitcoinDeserialize` traits. The wallet, network,
//! and SPV crates build on these types and never touch raw byte layouts
//! themselves.

pub mod amount;
pub mod block;
mod compactint;
pub mod parameters;
pub mod serialization;
pub mod transaction;
pub mod transparent;
pub mod work;

pub use amount::Amount;
pub use compactint::CompactInt;
pub use serialization::{
    BitcoinDeserialize, BitcoinDeserializeInto, BitcoinSerialize, SerializationError,
};
