//! Consensus-critical serialization.
//!
//! This module contains the `BitcoinSerialize` and `BitcoinDeserialize`
//! traits, analogs of the Serde `Serialize` and `Deserialize` traits but
//! intended for the consensus-critical Bitcoin wire format, together with
//! blanket impls for the primitive types that format is built from.

mod deserialize;
mod error;

pub mod sha256d;

use chrono::{DateTime, Utc};

pub use deserialize::{BitcoinDeserialize, BitcoinDeserializeInto};
pub use error::SerializationError;

use crate::compactint::CompactInt;
use byteorder::{LittleEndian, WriteBytesExt};

/// Serialization into the Bitcoin wire format.
pub trait BitcoinSerialize {
    /// Write `self` to `target` in wire format.
    fn bitcoin_serialize<W: std::io::Write>(&self, target: W) -> Result<(), std::io::Error>;

    /// Serialize `self` into a fresh byte vector.
    fn bitcoin_serialize_to_vec(&self) -> Result<Vec<u8>, std::io::Error> {
        let mut data = Vec::new();
        self.bitcoin_serialize(&mut data)?;
        Ok(data)
    }
}

impl BitcoinSerialize for u16 {
    fn bitcoin_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        target.write_u16::<LittleEndian>(*self)
    }
}

impl BitcoinSerialize for u32 {
    fn bitcoin_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        target.write_u32::<LittleEndian>(*self)
    }
}

impl BitcoinSerialize for u64 {
    fn bitcoin_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        target.write_u64::<LittleEndian>(*self)
    }
}

impl BitcoinSerialize for i32 {
    fn bitcoin_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        target.write_i32::<LittleEndian>(*self)
    }
}

impl BitcoinSerialize for DateTime<Utc> {
    fn bitcoin_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        // Bitcoin timestamps are u32 seconds; saturate rather than wrap.
        let time_u32 = u32::try_from(self.timestamp()).unwrap_or(u32::MAX);
        target.write_u32::<LittleEndian>(time_u32)
    }
}

impl BitcoinSerialize for [u8; 32] {
    fn bitcoin_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        target.write_all(self)
    }
}

// Note there is deliberately no `BitcoinSerialize for u8`: it would overlap
// with the length-prefixed `Vec<u8>` impl below through the generic `Vec<T>`
// impl.
impl BitcoinSerialize for Vec<u8> {
    fn bitcoin_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        CompactInt::from(self.len()).bitcoin_serialize(&mut target)?;
        target.write_all(self)?;
        Ok(())
    }
}

impl<T> BitcoinSerialize for Vec<T>
where
    T: BitcoinSerialize,
{
    fn bitcoin_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        CompactInt::from(self.len()).bitcoin_serialize(&mut target)?;
        for item in self.iter() {
            item.bitcoin_serialize(&mut target)?
        }
        Ok(())
    }
}
