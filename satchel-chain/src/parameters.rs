//! Consensus parameters for each Bitcoin network.

use crate::block;

use serde::{Deserialize, Serialize};

/// The Bitcoin network an address, key, or chain belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[cfg_attr(
    any(test, feature = "proptest-impl"),
    derive(proptest_derive::Arbitrary)
)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// The production network.
    Mainnet,
    /// The public test network.
    Testnet,
    /// A local regression-test network with a trivial proof-of-work target.
    Regtest,
}

impl Default for Network {
    fn default() -> Self {
        Network::Mainnet
    }
}

/// The previous block hash for the genesis block.
///
/// All known networks use the Bitcoin `null` value for the parent of the
/// genesis block.
pub const GENESIS_PREVIOUS_BLOCK_HASH: block::Hash = block::Hash([0; 32]);

/// Returns the hash of the genesis block in `network`, or `None` for
/// regtest, where any valid height-zero header is accepted.
pub fn genesis_hash(network: Network) -> Option<block::Hash> {
    let hash = match network {
        // bitcoin-cli getblockhash 0
        Network::Mainnet => "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
        // bitcoin-cli -testnet getblockhash 0
        Network::Testnet => "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
        Network::Regtest => return None,
    };
    Some(hash.parse().expect("hard-coded hash parses"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn genesis_hashes_parse() {
        assert!(genesis_hash(Network::Mainnet).is_some());
        assert!(genesis_hash(Network::Testnet).is_some());
        assert!(genesis_hash(Network::Regtest).is_none());
    }
}
