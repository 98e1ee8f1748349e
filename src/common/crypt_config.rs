//! Authenticated encryption for stored objects.
//!
//! Cipher is AES_256_GCM, which is fast and provides authenticated
//! encryption; every object gets a fresh random IV and carries the GCM
//! tag in its header.

use anyhow::{bail, Error};
use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher};

/// Encryption configuration with secret key.
pub struct CryptConfig {
    cipher: Cipher,
    enc_key: [u8; 32],
}

impl CryptConfig {
    pub fn new(enc_key: [u8; 32]) -> Self {
        Self {
            cipher: Cipher::aes_256_gcm(),
            enc_key,
        }
    }

    /// Derive the encryption key from a passphrase (pbkdf2_hmac/sha256).
    pub fn from_passphrase(passphrase: &[u8], salt: &[u8]) -> Result<Self, Error> {
        let mut enc_key = [0u8; 32];
        pbkdf2_hmac(passphrase, salt, 1000, MessageDigest::sha256(), &mut enc_key)?;
        Ok(Self::new(enc_key))
    }

    /// Parse a hex encoded 32 byte key.
    pub fn from_hex_key(key: &str) -> Result<Self, Error> {
        let bytes = hex::decode(key)?;
        if bytes.len() != 32 {
            bail!("encryption key must be 32 bytes, got {}", bytes.len());
        }
        let mut enc_key = [0u8; 32];
        enc_key.copy_from_slice(&bytes);
        Ok(Self::new(enc_key))
    }

    /// Encrypt `data`, returning the ciphertext plus the IV and GCM tag
    /// that decryption needs back.
    pub fn encrypt(&self, data: &[u8]) -> Result<(Vec<u8>, [u8; 16], [u8; 16]), Error> {
        let mut iv = [0u8; 16];
        openssl::rand::rand_bytes(&mut iv)?;
        let mut tag = [0u8; 16];
        let ciphertext = encrypt_aead(self.cipher, &self.enc_key, Some(&iv), b"", data, &mut tag)?;
        Ok((ciphertext, iv, tag))
    }

    pub fn decrypt(&self, data: &[u8], iv: &[u8; 16], tag: &[u8; 16]) -> Result<Vec<u8>, Error> {
        let plaintext = decrypt_aead(self.cipher, &self.enc_key, Some(iv), b"", data, tag)?;
        Ok(plaintext)
    }
}
