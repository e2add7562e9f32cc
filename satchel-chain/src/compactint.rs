use byteorder::{LittleEndian, WriteBytesExt};

use crate::{BitcoinDeserialize, BitcoinSerialize, SerializationError};

/// A Bitcoin variable-length integer ("CompactSize").
///
/// Counts below 253 are a single byte; larger counts carry a marker byte
/// followed by a little-endian u16, u32, or u64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactInt(u64);

impl CompactInt {
    /// Wrap a length as a compact integer.
    pub fn from(value: usize) -> CompactInt {
        CompactInt(value as u64)
    }

    /// The wrapped value.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The number of bytes `value` occupies when serialized.
    pub fn size(value: usize) -> usize {
        if value < 253 {
            1
        } else if value <= u16::MAX as usize {
            3
        } else if value <= u32::MAX as usize {
            5
        } else {
            9
        }
    }
}

impl BitcoinSerialize for CompactInt {
    fn bitcoin_serialize<W>(&self, mut target: W) -> Result<(), std::io::Error>
    where
        W: std::io::Write,
    {
        if self.0 < 253 {
            target.write_all(&[self.0 as u8])
        } else if self.0 <= u16::MAX as u64 {
            target.write_all(&[253])?;
            target.write_u16::<LittleEndian>(self.0 as u16)
        } else if self.0 <= u32::MAX as u64 {
            target.write_all(&[254])?;
            target.write_u32::<LittleEndian>(self.0 as u32)
        } else {
            target.write_all(&[255])?;
            target.write_u64::<LittleEndian>(self.0)
        }
    }
}

impl BitcoinDeserialize for CompactInt {
    fn bitcoin_deserialize<R: std::io::Read>(
        mut reader: R,
    ) -> Result<CompactInt, SerializationError> {
        let first = u8::bitcoin_deserialize(&mut reader)?;
        match first {
            253 => Ok(CompactInt(u16::bitcoin_deserialize(&mut reader)? as u64)),
            254 => Ok(CompactInt(u32::bitcoin_deserialize(&mut reader)? as u64)),
            255 => Ok(CompactInt(u64::bitcoin_deserialize(&mut reader)?)),
            small => Ok(CompactInt(small as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: usize, expected_wire: &[u8]) {
        let encoded = CompactInt::from(value)
            .bitcoin_serialize_to_vec()
            .expect("writing to a Vec never fails");
        assert_eq!(encoded, expected_wire);
        assert_eq!(encoded.len(), CompactInt::size(value));
        let decoded = CompactInt::bitcoin_deserialize(&encoded[..]).expect("valid encoding");
        assert_eq!(decoded.value(), value as u64);
    }

    #[test]
    fn boundary_encodings() {
        roundtrip(0, &[0]);
        roundtrip(252, &[252]);
        roundtrip(253, &[253, 253, 0]);
        roundtrip(0xffff, &[253, 0xff, 0xff]);
        roundtrip(0x10000, &[254, 0, 0, 1, 0]);
        roundtrip(0xffff_ffff, &[254, 0xff, 0xff, 0xff, 0xff]);
        roundtrip(0x1_0000_0000, &[255, 0, 0, 0, 0, 1, 0, 0, 0]);
    }
}
