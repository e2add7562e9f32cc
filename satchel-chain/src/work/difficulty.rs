//! Block difficulty data structures and calculations.
//!
//! The block difficulty "target threshold" is stored in the block header as
//! a 32-bit `CompactDifficulty` (nBits). The `ExpandedDifficulty` is the
//! 256-bit number the header hash is compared against.

use std::cmp::Ordering;

use primitive_types::U256;

use crate::{block, parameters::Network, BitcoinDeserialize, BitcoinSerialize};

/// A 32-bit "compact bits" value, as used in Bitcoin block headers.
///
/// Ordering on compact values is deliberately not provided: compare the
/// expanded forms instead.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CompactDifficulty(pub u32);

/// A 256-bit target threshold.
///
/// Note: a greater threshold represents *less* work.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct ExpandedDifficulty(U256);

impl CompactDifficulty {
    /// Expand the nBits mantissa/exponent encoding into a 256-bit target.
    ///
    /// Returns `None` for encodings that are zero, negative, or overflow
    /// 256 bits; headers carrying them are invalid.
    pub fn to_expanded(&self) -> Option<ExpandedDifficulty> {
        let exponent = (self.0 >> 24) as usize;
        // The top mantissa bit is a sign bit in Bitcoin's encoding; targets
        // are never negative.
        let mantissa = self.0 & 0x007f_ffff;
        if mantissa == 0 || self.0 & 0x0080_0000 != 0 {
            return None;
        }

        let target = if exponent <= 3 {
            U256::from(mantissa >> (8 * (3 - exponent)))
        } else {
            let shift = 8 * (exponent - 3);
            if shift > 232 {
                return None;
            }
            U256::from(mantissa) << shift
        };
        if target.is_zero() {
            return None;
        }
        Some(ExpandedDifficulty(target))
    }
}

impl BitcoinSerialize for CompactDifficulty {
    fn bitcoin_serialize<W: std::io::Write>(&self, writer: W) -> Result<(), std::io::Error> {
        self.0.bitcoin_serialize(writer)
    }
}

impl BitcoinDeserialize for CompactDifficulty {
    fn bitcoin_deserialize<R: std::io::Read>(
        reader: R,
    ) -> Result<Self, crate::SerializationError> {
        Ok(CompactDifficulty(u32::bitcoin_deserialize(reader)?))
    }
}

impl ExpandedDifficulty {
    /// The easiest target any header on `network` is allowed to declare.
    pub fn target_difficulty_limit(network: Network) -> ExpandedDifficulty {
        let limit = match network {
            // `powLimit` in the Bitcoin reference implementation.
            Network::Mainnet | Network::Testnet => CompactDifficulty(0x1d00_ffff),
            Network::Regtest => CompactDifficulty(0x207f_ffff),
        };
        limit
            .to_expanded()
            .expect("hard-coded difficulty limits expand")
    }
}

impl From<block::Hash> for ExpandedDifficulty {
    /// The header hash interpreted as a little-endian 256-bit integer, the
    /// quantity proof-of-work compares against the target.
    fn from(hash: block::Hash) -> Self {
        ExpandedDifficulty(U256::from_little_endian(&hash.0))
    }
}

impl PartialEq<ExpandedDifficulty> for block::Hash {
    fn eq(&self, other: &ExpandedDifficulty) -> bool {
        ExpandedDifficulty::from(*self) == *other
    }
}

impl PartialOrd<ExpandedDifficulty> for block::Hash {
    fn partial_cmp(&self, other: &ExpandedDifficulty) -> Option<Ordering> {
        ExpandedDifficulty::from(*self).partial_cmp(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_limit_expands() {
        // 0x1d00ffff is 0xffff shifted left by 26 nibble pairs.
        let limit = CompactDifficulty(0x1d00_ffff).to_expanded().unwrap();
        let expected = ExpandedDifficulty(U256::from(0xffff_u64) << (8 * 26));
        assert_eq!(limit, expected);
    }

    #[test]
    fn invalid_encodings_rejected() {
        assert_eq!(CompactDifficulty(0).to_expanded(), None);
        // Sign bit set.
        assert_eq!(CompactDifficulty(0x1d80_0000).to_expanded(), None);
        // Exponent too large for 256 bits.
        assert_eq!(CompactDifficulty(0xff7f_ffff).to_expanded(), None);
    }

    #[test]
    fn hash_comparison_is_little_endian() {
        let limit = ExpandedDifficulty::target_difficulty_limit(Network::Mainnet);

        // A hash ending in many zero bytes is numerically small.
        let mut easy = [0xffu8; 32];
        easy[4..].iter_mut().for_each(|b| *b = 0);
        assert!(block::Hash(easy) < limit);

        // A hash with its top (trailing) bytes set is numerically huge.
        let hard = [0xffu8; 32];
        assert!(block::Hash(hard) > limit);
    }

    #[test]
    fn genesis_nonce_satisfies_mainnet_target() {
        let genesis = crate::parameters::genesis_hash(Network::Mainnet).unwrap();
        let target = CompactDifficulty(0x1d00_ffff).to_expanded().unwrap();
        assert!(genesis <= target);
    }
}
