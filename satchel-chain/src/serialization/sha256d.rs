//! SHA-256d, the double SHA-256 hash that Bitcoin uses for block hashes,
//! transaction ids, checksums, and key-stretching material.

use std::io;

use sha2::{Digest, Sha256};

/// Compute the SHA-256d digest of `data` in one shot.
pub fn hash(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let mut output = [0u8; 32];
    output.copy_from_slice(&Sha256::digest(&first));
    output
}

/// An `io::Write` adapter that computes a SHA-256d digest of everything
/// written to it. Writing never fails.
#[derive(Default)]
pub struct Writer {
    hash: Sha256,
}

impl io::Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.hash.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Writer {
    /// Consume the writer and produce the digest.
    pub fn finish(self) -> [u8; 32] {
        let first = self.hash.finalize();
        let mut output = [0u8; 32];
        output.copy_from_slice(&Sha256::digest(&first));
        output
    }
}

/// A 4-byte SHA-256d checksum, as used in Base58Check payloads.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Checksum(pub [u8; 4]);

impl<'a> From<&'a [u8]> for Checksum {
    fn from(bytes: &'a [u8]) -> Self {
        let digest = hash(bytes);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&digest[0..4]);
        Self(checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn oneshot_and_writer_agree() {
        let data = b"satchel";
        let mut writer = Writer::default();
        writer.write_all(data).expect("writer is infallible");
        assert_eq!(hash(data), writer.finish());
    }

    #[test]
    fn empty_input() {
        // sha256d of the empty string, a fixed point of the protocol.
        assert_eq!(
            hex::encode(hash(b"")),
            "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456"
        );
    }
}
