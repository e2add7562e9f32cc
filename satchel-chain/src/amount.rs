//! Satoshi amounts.
//!
//! Amounts are signed so that history deltas (credits and debits on one
//! address) and balances share a single type; wire serialization of an
//! output value rejects negative quantities.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// One bitcoin, in satoshis.
pub const COIN: i64 = 100_000_000;

/// The maximum number of satoshis that can ever exist.
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// A quantity of satoshis.
#[derive(
    Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(i64);

impl Amount {
    /// Zero satoshis.
    pub const ZERO: Amount = Amount(0);

    /// Construct an amount from a raw satoshi count.
    pub const fn from_sat(satoshis: i64) -> Amount {
        Amount(satoshis)
    }

    /// The raw satoshi count.
    pub const fn as_sat(&self) -> i64 {
        self.0
    }

    /// Checked addition.
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Checked subtraction.
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// True for debits.
    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Parse a decimal bitcoin string such as `"0.001"` into satoshis.
    pub fn from_btc_str(s: &str) -> Option<Amount> {
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if frac.len() > 8 || (!frac.is_empty() && !frac.bytes().all(|b| b.is_ascii_digit())) {
            return None;
        }
        let whole: i64 = whole.parse().ok()?;
        let mut frac_sat: i64 = if frac.is_empty() { 0 } else { frac.parse().ok()? };
        frac_sat *= 10_i64.pow(8 - frac.len() as u32);
        let sat = whole.checked_mul(COIN)?.checked_add(frac_sat)?;
        if sat > MAX_MONEY {
            return None;
        }
        Some(Amount(sat))
    }
}

impl fmt::Display for Amount {
    /// Formats the amount as decimal bitcoin, e.g. `0.89900000`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let magnitude = self.0.unsigned_abs();
        write!(
            f,
            "{}{}.{:08}",
            sign,
            magnitude / COIN as u64,
            magnitude % COIN as u64
        )
    }
}

impl std::iter::Sum<Amount> for Option<Amount> {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Option<Amount> {
        iter.fold(Some(Amount::ZERO), |acc, x| acc?.checked_add(x))
    }
}

impl BitcoinSerialize for Amount {
    fn bitcoin_serialize<W: io::Write>(&self, target: W) -> Result<(), io::Error> {
        if self.0 < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "negative amount in transaction output",
            ));
        }
        (self.0 as u64).bitcoin_serialize(target)
    }
}

impl BitcoinDeserialize for Amount {
    fn bitcoin_deserialize<R: io::Read>(reader: R) -> Result<Amount, SerializationError> {
        let value = u64::bitcoin_deserialize(reader)?;
        if value > MAX_MONEY as u64 {
            return Err(SerializationError::Parse("amount above MAX_MONEY"));
        }
        Ok(Amount(value as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btc_string_parsing() {
        assert_eq!(Amount::from_btc_str("1"), Some(Amount::from_sat(COIN)));
        assert_eq!(Amount::from_btc_str("0.1"), Some(Amount::from_sat(10_000_000)));
        assert_eq!(Amount::from_btc_str("0.00000001"), Some(Amount::from_sat(1)));
        assert_eq!(
            Amount::from_btc_str("0.899"),
            Some(Amount::from_sat(89_900_000))
        );
        assert_eq!(Amount::from_btc_str("0.000000001"), None);
        assert_eq!(Amount::from_btc_str("22000000"), None);
        assert_eq!(Amount::from_btc_str("x"), None);
    }

    #[test]
    fn display_is_fixed_point() {
        assert_eq!(Amount::from_sat(89_900_000).to_string(), "0.89900000");
        assert_eq!(Amount::from_sat(-1).to_string(), "-0.00000001");
        assert_eq!(Amount::from_sat(COIN).to_string(), "1.00000000");
    }

    #[test]
    fn wire_rejects_out_of_range() {
        assert!(Amount::from_sat(-1).bitcoin_serialize_to_vec().is_err());
        let encoded = (MAX_MONEY as u64 + 1).bitcoin_serialize_to_vec().unwrap();
        assert!(Amount::bitcoin_deserialize(&encoded[..]).is_err());
    }
}
