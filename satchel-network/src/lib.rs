//! The indexer-server client.
//!
//! A satchel wallet never talks to the Bitcoin peer-to-peer network
//! directly. Instead it queries an untrusted indexer server for address
//! histories, raw transactions, Merkle branches, and block headers, over
//! one of three wire protocols selected by port number:
//!
//! * a persistent TCP connection carrying newline-delimited JSON-RPC,
//!   with server-push subscriptions,
//! * the legacy "native" protocol: one short-lived TCP connection per
//!   request, carrying a Python-literal tuple, with session-based polling,
//! * JSON-RPC over HTTP POST, also session-based.
//!
//! Nothing a server returns is trusted: callers verify transactions against
//! their own header chain before treating them as confirmed.

mod client;
mod error;
pub mod literal;
pub mod protocol;
mod transport;

pub use client::{Client, ClientConfig, Notification};
pub use error::Error;
pub use protocol::{HistoryEntry, MerkleProof, Method, Peer};
pub use transport::{Protocol, ServerAddr};
