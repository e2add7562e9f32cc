//! Transport-independent method names and typed results.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use satchel_chain::{
    amount::Amount,
    block,
    transaction,
    transparent::Script,
    work::difficulty::CompactDifficulty,
};

use crate::error::Error;

/// The request methods a satchel client issues.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Method {
    /// Exchange client and server version strings.
    ServerVersion,
    /// Fetch the server's welcome text.
    ServerBanner,
    /// Fetch the list of other known servers.
    ServerPeers,
    /// Subscribe to chain-tip height updates.
    NumblocksSubscribe,
    /// Subscribe to status updates for one address.
    AddressSubscribe,
    /// Fetch the full history of one address.
    AddressGetHistory,
    /// Fetch a raw transaction by txid.
    TransactionGet,
    /// Fetch the Merkle branch of a confirmed transaction.
    TransactionGetMerkle,
    /// Fetch one block header by height.
    BlockGetHeader,
    /// Broadcast a signed raw transaction.
    TransactionBroadcast,
}

impl Method {
    /// The JSON-RPC method name.
    pub fn name(&self) -> &'static str {
        match self {
            Method::ServerVersion => "server.version",
            Method::ServerBanner => "server.banner",
            Method::ServerPeers => "server.peers",
            Method::NumblocksSubscribe => "numblocks.subscribe",
            Method::AddressSubscribe => "address.subscribe",
            Method::AddressGetHistory => "address.get_history",
            Method::TransactionGet => "blockchain.transaction.get",
            Method::TransactionGetMerkle => "blockchain.transaction.get_merkle",
            Method::BlockGetHeader => "blockchain.block.get_header",
            Method::TransactionBroadcast => "transaction.broadcast",
        }
    }

    /// How long to wait for an answer before treating the request as lost.
    pub fn timeout(&self) -> std::time::Duration {
        match self {
            // Proof and header lookups hit the server's disk indexes and can
            // be slow on busy servers.
            Method::TransactionGetMerkle | Method::BlockGetHeader => {
                std::time::Duration::from_secs(30)
            }
            _ => std::time::Duration::from_secs(5),
        }
    }
}

/// One row of an address's history, as reported by the server and kept in
/// the wallet store.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// The transaction this row belongs to.
    pub tx_hash: transaction::Hash,
    /// Confirmation height; zero for mempool transactions.
    pub height: u32,
    /// The signed effect on the address: positive for outputs paying it,
    /// negative for inputs spending from it.
    pub value: Amount,
    /// The index of the output (or input) within the transaction.
    pub pos: u32,
    /// Set when this row funds the address: the row is a spend of it.
    pub is_input: bool,
    /// For unredeemed outputs the server includes the lock script.
    pub script_pubkey: Option<Script>,
    /// Block timestamp, or zero for mempool transactions.
    pub timestamp: u32,
}

impl HistoryEntry {
    /// Parse one history row from a server response value.
    ///
    /// Servers have been seen reporting missing or negative heights for
    /// mempool transactions; both are normalized to zero.
    pub fn from_wire(row: &Value) -> Result<HistoryEntry, Error> {
        let tx_hash: transaction::Hash = row
            .get("tx_hash")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::malformed("history row without tx_hash"))?
            .parse()
            .map_err(|_| Error::malformed("history tx_hash is not a hash"))?;

        let height = match row.get("height").and_then(Value::as_i64) {
            Some(height @ 1..) => height as u32,
            Some(0) => 0,
            reported => {
                warn!(?tx_hash, ?reported, "odd history height, treating as unconfirmed");
                0
            }
        };

        let value = row
            .get("value")
            .and_then(Value::as_i64)
            .map(Amount::from_sat)
            .ok_or_else(|| Error::malformed("history row without value"))?;

        let pos = row
            .get("pos")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::malformed("history row without pos"))? as u32;

        let is_input = match row.get("is_in").or_else(|| row.get("is_input")) {
            Some(Value::Bool(b)) => *b,
            Some(v) => v.as_i64() == Some(1),
            None => return Err(Error::malformed("history row without is_in")),
        };

        let script_pubkey = match row.get("raw_scriptPubKey").and_then(Value::as_str) {
            Some(hex_script) => Some(Script(hex::decode(hex_script).map_err(|_| {
                Error::malformed("history scriptPubKey is not hex")
            })?)),
            None => None,
        };

        let timestamp = row
            .get("nTime")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        Ok(HistoryEntry {
            tx_hash,
            height,
            value,
            pos,
            is_input,
            script_pubkey,
            timestamp,
        })
    }

    /// Parse a whole `address.get_history` response.
    pub fn list_from_wire(result: &Value) -> Result<Vec<HistoryEntry>, Error> {
        match result {
            // Some servers answer `None` for a fresh address.
            Value::Null => Ok(Vec::new()),
            Value::Array(rows) => rows.iter().map(HistoryEntry::from_wire).collect(),
            _ => Err(Error::malformed("history is not a list")),
        }
    }
}

/// A Merkle branch for one transaction, as returned by
/// `blockchain.transaction.get_merkle`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MerkleProof {
    /// Sibling hashes from the leaf level upward.
    pub branch: Vec<transaction::Hash>,
    /// The transaction's index within its block.
    pub pos: u32,
    /// The height of the block containing the transaction.
    pub block_height: u32,
}

impl MerkleProof {
    /// Parse a Merkle proof from a server response value.
    pub fn from_wire(result: &Value) -> Result<MerkleProof, Error> {
        let branch = result
            .get("merkle")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::malformed("merkle proof without branch"))?
            .iter()
            .map(|item| {
                item.as_str()
                    .ok_or_else(|| Error::malformed("merkle node is not a string"))?
                    .parse()
                    .map_err(|_| Error::malformed("merkle node is not a hash"))
            })
            .collect::<Result<Vec<transaction::Hash>, Error>>()?;
        let pos = result
            .get("pos")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::malformed("merkle proof without pos"))? as u32;
        let block_height = result
            .get("block_height")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::malformed("merkle proof without height"))? as u32;
        Ok(MerkleProof {
            branch,
            pos,
            block_height,
        })
    }
}

/// Another indexer server, from `server.peers`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Peer {
    /// Raw IP address.
    pub ip: String,
    /// Advertised hostname.
    pub hostname: String,
    /// Free-form feature flags (ports, pruning, versions).
    pub features: Vec<String>,
}

impl Peer {
    /// Parse the `server.peers` response.
    pub fn list_from_wire(result: &Value) -> Result<Vec<Peer>, Error> {
        let rows = result
            .as_array()
            .ok_or_else(|| Error::malformed("peer list is not a list"))?;
        rows.iter()
            .map(|row| {
                let fields = row
                    .as_array()
                    .ok_or_else(|| Error::malformed("peer row is not a list"))?;
                let ip = fields
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let hostname = fields
                    .get(1)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let features = fields
                    .get(2)
                    .and_then(Value::as_array)
                    .map(|flags| {
                        flags
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Peer {
                    ip,
                    hostname,
                    features,
                })
            })
            .collect()
    }
}

/// Parse a `blockchain.block.get_header` response into a header and its
/// reported height.
pub fn header_from_wire(result: &Value) -> Result<(u32, block::Header), Error> {
    let field_u64 = |name: &'static str| {
        result
            .get(name)
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Response(format!("header without {}", name)))
    };
    let field_hash = |name: &'static str| -> Result<block::Hash, Error> {
        match result.get(name).and_then(Value::as_str) {
            Some(text) => text
                .parse()
                .map_err(|_| Error::Response(format!("header {} is not a hash", name))),
            // The genesis header has no previous hash field on some servers.
            None => Ok(block::Hash([0; 32])),
        }
    };

    let height = field_u64("block_height")? as u32;
    let merkle_root: block::merkle::Root = result
        .get("merkle_root")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::malformed("header without merkle_root"))?
        .parse()
        .map_err(|_| Error::malformed("header merkle_root is not a hash"))?;

    let timestamp = field_u64("timestamp")? as i64;
    let time = chrono_from_timestamp(timestamp)
        .ok_or_else(|| Error::malformed("header timestamp out of range"))?;

    let header = block::Header {
        version: field_u64("version")? as u32,
        previous_block_hash: field_hash("prev_block_hash")?,
        merkle_root,
        time,
        difficulty_threshold: CompactDifficulty(field_u64("bits")? as u32),
        nonce: field_u64("nonce")? as u32,
    };
    Ok((height, header))
}

fn chrono_from_timestamp(timestamp: i64) -> Option<chrono::DateTime<chrono::Utc>> {
    use chrono::TimeZone;
    chrono::Utc.timestamp_opt(timestamp, 0).single()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn history_entry_from_server_row() {
        let row = json!({
            "tx_hash": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            "height": 170,
            "is_in": 0,
            "value": 5_000_000_000_i64,
            "pos": 0,
            "nTime": 1231731025,
            "raw_scriptPubKey": "76a914000000000000000000000000000000000000000088ac",
        });
        let entry = HistoryEntry::from_wire(&row).unwrap();
        assert_eq!(entry.height, 170);
        assert!(!entry.is_input);
        assert_eq!(entry.value.as_sat(), 5_000_000_000);
        assert_eq!(entry.script_pubkey.as_ref().unwrap().0.len(), 25);
        assert_eq!(entry.timestamp, 1231731025);
    }

    #[test]
    fn negative_and_missing_heights_are_unconfirmed() {
        for height in [json!(-1), Value::Null] {
            let row = json!({
                "tx_hash": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
                "height": height,
                "is_in": 1,
                "value": -250_000,
                "pos": 0,
            });
            let entry = HistoryEntry::from_wire(&row).unwrap();
            assert_eq!(entry.height, 0);
            assert!(entry.is_input);
        }
    }

    #[test]
    fn merkle_proof_from_wire() {
        let result = json!({
            "merkle": ["4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"],
            "pos": 1,
            "block_height": 100,
        });
        let proof = MerkleProof::from_wire(&result).unwrap();
        assert_eq!(proof.branch.len(), 1);
        assert_eq!(proof.pos, 1);
        assert_eq!(proof.block_height, 100);
    }

    #[test]
    fn header_from_wire_roundtrips_genesis() {
        let result = json!({
            "block_height": 0,
            "version": 1,
            "prev_block_hash": "0000000000000000000000000000000000000000000000000000000000000000",
            "merkle_root": "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
            "timestamp": 1231006505,
            "bits": 0x1d00ffff_u32,
            "nonce": 0x7c2bac1d_u32,
        });
        let (height, header) = header_from_wire(&result).unwrap();
        assert_eq!(height, 0);
        assert_eq!(
            Some(header.hash()),
            satchel_chain::parameters::genesis_hash(satchel_chain::parameters::Network::Mainnet)
        );
    }
}
