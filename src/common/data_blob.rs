//! Stored object binary format.
//!
//! Every object written to the object store - content blobs as well as
//! JSON documents - is wrapped in a tagged container: an 8 byte magic,
//! a CRC32 of the payload, and for encrypted objects the AES-GCM IV and
//! tag. The magic selects one of four encodings (plain, compressed,
//! encrypted, encrypted+compressed).

use std::convert::TryInto;

use anyhow::{bail, Error};

use crate::common::crypt_config::CryptConfig;

pub const UNCOMPRESSED_OBJECT_MAGIC_1_0: [u8; 8] = [43, 140, 12, 197, 2, 84, 188, 90];
pub const COMPRESSED_OBJECT_MAGIC_1_0: [u8; 8] = [158, 41, 223, 11, 70, 199, 4, 126];
pub const ENCRYPTED_OBJECT_MAGIC_1_0: [u8; 8] = [9, 182, 116, 31, 245, 60, 203, 17];
pub const ENCR_COMPR_OBJECT_MAGIC_1_0: [u8; 8] = [74, 206, 57, 129, 6, 241, 118, 165];

const MAX_OBJECT_SIZE: usize = 128 * 1024 * 1024;

// magic + crc32
const PLAIN_HEADER_LEN: usize = 8 + 4;
// magic + crc32 + iv + tag
const ENCRYPTED_HEADER_LEN: usize = 8 + 4 + 16 + 16;

/// One encoded object, ready to be written to or just read from the
/// object store.
pub struct DataBlob {
    raw_data: Vec<u8>,
}

impl DataBlob {
    pub fn raw_data(&self) -> &[u8] {
        &self.raw_data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.raw_data
    }

    fn magic(&self) -> &[u8; 8] {
        self.raw_data[0..8].try_into().unwrap()
    }

    fn header_size(magic: &[u8; 8]) -> usize {
        match *magic {
            UNCOMPRESSED_OBJECT_MAGIC_1_0 | COMPRESSED_OBJECT_MAGIC_1_0 => PLAIN_HEADER_LEN,
            ENCRYPTED_OBJECT_MAGIC_1_0 | ENCR_COMPR_OBJECT_MAGIC_1_0 => ENCRYPTED_HEADER_LEN,
            _ => unreachable!("unknown object magic"),
        }
    }

    fn crc(&self) -> u32 {
        u32::from_le_bytes(self.raw_data[8..12].try_into().unwrap())
    }

    fn set_crc(&mut self, crc: u32) {
        self.raw_data[8..12].copy_from_slice(&crc.to_le_bytes());
    }

    fn compute_crc(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.raw_data[Self::header_size(self.magic())..]);
        hasher.finalize()
    }

    pub fn verify_crc(&self) -> Result<(), Error> {
        if self.compute_crc() != self.crc() {
            bail!("stored object has wrong CRC checksum");
        }
        Ok(())
    }

    /// Encode `data`, optionally compressed and/or encrypted.
    pub fn encode(
        data: &[u8],
        config: Option<&CryptConfig>,
        compress: bool,
    ) -> Result<Self, Error> {
        if data.len() > MAX_OBJECT_SIZE {
            bail!("object too large ({} bytes)", data.len());
        }

        let compr_data;
        let (data, compressed) = if compress {
            compr_data = zstd::block::compress(data, 1)?;
            // compression only pays off if the result is shorter
            if compr_data.len() < data.len() {
                (&compr_data[..], true)
            } else {
                (data, false)
            }
        } else {
            (data, false)
        };

        let mut blob = if let Some(config) = config {
            let magic = if compressed {
                ENCR_COMPR_OBJECT_MAGIC_1_0
            } else {
                ENCRYPTED_OBJECT_MAGIC_1_0
            };
            let (ciphertext, iv, tag) = config.encrypt(data)?;
            let mut raw_data = Vec::with_capacity(ENCRYPTED_HEADER_LEN + ciphertext.len());
            raw_data.extend_from_slice(&magic);
            raw_data.extend_from_slice(&[0u8; 4]);
            raw_data.extend_from_slice(&iv);
            raw_data.extend_from_slice(&tag);
            raw_data.extend_from_slice(&ciphertext);
            DataBlob { raw_data }
        } else {
            let magic = if compressed {
                COMPRESSED_OBJECT_MAGIC_1_0
            } else {
                UNCOMPRESSED_OBJECT_MAGIC_1_0
            };
            let mut raw_data = Vec::with_capacity(PLAIN_HEADER_LEN + data.len());
            raw_data.extend_from_slice(&magic);
            raw_data.extend_from_slice(&[0u8; 4]);
            raw_data.extend_from_slice(data);
            DataBlob { raw_data }
        };

        blob.set_crc(blob.compute_crc());
        Ok(blob)
    }

    /// Reconstruct a blob from raw object store bytes.
    pub fn from_raw(raw_data: Vec<u8>) -> Result<Self, Error> {
        if raw_data.len() < PLAIN_HEADER_LEN {
            bail!("stored object too short ({} bytes)", raw_data.len());
        }
        let magic: [u8; 8] = raw_data[0..8].try_into().unwrap();
        match magic {
            UNCOMPRESSED_OBJECT_MAGIC_1_0 | COMPRESSED_OBJECT_MAGIC_1_0 => {}
            ENCRYPTED_OBJECT_MAGIC_1_0 | ENCR_COMPR_OBJECT_MAGIC_1_0 => {
                if raw_data.len() < ENCRYPTED_HEADER_LEN {
                    bail!("encrypted object too short ({} bytes)", raw_data.len());
                }
            }
            _ => bail!("stored object has unknown magic"),
        }
        Ok(DataBlob { raw_data })
    }

    /// Decode the payload; fails on CRC mismatch, on a missing key for
    /// encrypted objects, and on authentication failure.
    pub fn decode(&self, config: Option<&CryptConfig>) -> Result<Vec<u8>, Error> {
        self.verify_crc()?;
        let magic = *self.magic();

        if magic == UNCOMPRESSED_OBJECT_MAGIC_1_0 {
            Ok(self.raw_data[PLAIN_HEADER_LEN..].to_vec())
        } else if magic == COMPRESSED_OBJECT_MAGIC_1_0 {
            let data = zstd::block::decompress(&self.raw_data[PLAIN_HEADER_LEN..], MAX_OBJECT_SIZE)?;
            Ok(data)
        } else {
            let config = match config {
                Some(config) => config,
                None => bail!("unable to decrypt object - no encryption key configured"),
            };
            let iv: [u8; 16] = self.raw_data[12..28].try_into().unwrap();
            let tag: [u8; 16] = self.raw_data[28..44].try_into().unwrap();
            let data = config.decrypt(&self.raw_data[ENCRYPTED_HEADER_LEN..], &iv, &tag)?;
            if magic == ENCR_COMPR_OBJECT_MAGIC_1_0 {
                Ok(zstd::block::decompress(&data, MAX_OBJECT_SIZE)?)
            } else {
                Ok(data)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compressed_roundtrip() {
        let data = b"foobar".repeat(100);
        let blob = DataBlob::encode(&data, None, true).unwrap();
        assert!(blob.raw_data().len() < data.len());
        let blob = DataBlob::from_raw(blob.into_inner()).unwrap();
        assert_eq!(blob.decode(None).unwrap(), data);
    }

    #[test]
    fn test_incompressible_data_stays_plain() {
        // too short for zstd to win
        let blob = DataBlob::encode(b"x", None, true).unwrap();
        assert_eq!(blob.magic(), &UNCOMPRESSED_OBJECT_MAGIC_1_0);
        assert_eq!(blob.decode(None).unwrap(), b"x");
    }

    #[test]
    fn test_encrypted_roundtrip_needs_key() {
        let config = CryptConfig::new([3u8; 32]);
        let data = b"secret".repeat(50);
        let blob = DataBlob::encode(&data, Some(&config), true).unwrap();
        let blob = DataBlob::from_raw(blob.into_inner()).unwrap();
        assert!(blob.decode(None).is_err());
        assert_eq!(blob.decode(Some(&config)).unwrap(), data);
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let blob = DataBlob::encode(b"data data data", None, false).unwrap();
        let mut raw = blob.into_inner();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let blob = DataBlob::from_raw(raw).unwrap();
        assert!(blob.decode(None).is_err());
    }
}
