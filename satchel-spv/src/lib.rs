//! Simplified payment verification.
//!
//! The wallet trusts no server claim about confirmations. This crate keeps
//! a locally validated chain of block headers and checks a Merkle branch
//! for every transaction the wallet cares about, producing a verification
//! stamp only when the branch hashes to the root inside a header the
//! client itself walked and proof-of-work-checked.

mod error;
mod headers;
mod verifier;

pub use error::HeaderError;
pub use headers::HeaderChain;
pub use verifier::{Event, Request, VerifiedStamp, Verifier};
