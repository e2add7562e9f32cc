use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use std::io;

use super::CompactInt;
use super::SerializationError;

type Result<R> = std::result::Result<R, SerializationError>;

/// Deserialization from the Bitcoin wire format.
pub trait BitcoinDeserialize {
    /// Read a value of this type from `reader` in wire format.
    fn bitcoin_deserialize<R: io::Read>(reader: R) -> Result<Self>
    where
        Self: Sized;
}

/// Helper for deserializing more succinctly via type inference
pub trait BitcoinDeserializeInto {
    /// Deserialize based on type inference
    fn bitcoin_deserialize_into<T>(self) -> Result<T>
    where
        T: BitcoinDeserialize;
}

impl<R: io::Read> BitcoinDeserializeInto for R {
    fn bitcoin_deserialize_into<T>(self) -> Result<T>
    where
        T: BitcoinDeserialize,
    {
        T::bitcoin_deserialize(self)
    }
}

impl BitcoinDeserialize for u8 {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<u8> {
        Ok(reader.read_u8()?)
    }
}

impl BitcoinDeserialize for u16 {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<u16> {
        Ok(reader.read_u16::<LittleEndian>()?)
    }
}

impl BitcoinDeserialize for u32 {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<u32> {
        Ok(reader.read_u32::<LittleEndian>()?)
    }
}

impl BitcoinDeserialize for u64 {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<u64> {
        Ok(reader.read_u64::<LittleEndian>()?)
    }
}

impl BitcoinDeserialize for i32 {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<i32> {
        Ok(reader.read_i32::<LittleEndian>()?)
    }
}

impl BitcoinDeserialize for DateTime<Utc> {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<DateTime<Utc>> {
        let timestamp = reader.read_u32::<LittleEndian>()? as i64;
        Ok(Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .expect("u32 timestamps are always in range"))
    }
}

impl<T> BitcoinDeserialize for Vec<T>
where
    T: BitcoinDeserialize,
{
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<Vec<T>> {
        let len = CompactInt::bitcoin_deserialize(&mut reader)?.value() as usize;
        // Limit preallocation to about 1000 items since blind preallocation
        // based on an attacker-supplied length is a DOS vulnerability.
        let blind_alloc_limit = 1024;
        let mut result: Vec<T> = Vec::with_capacity(std::cmp::min(len, blind_alloc_limit));
        for _ in 0..len {
            result.push(T::bitcoin_deserialize(&mut reader)?);
        }
        Ok(result)
    }
}

impl BitcoinDeserialize for [u8; 32] {
    fn bitcoin_deserialize<R: io::Read>(mut reader: R) -> Result<[u8; 32]> {
        let mut result = [0u8; 32];
        reader.read_exact(&mut result)?;
        Ok(result)
    }
}
