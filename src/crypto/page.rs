//! The per-page transform: a bijective, page-indexed authenticated codec
//! with constant 28-byte overhead.
//!
//! Layout of a transformed page: `nonce(12) || ciphertext || tag(16)`.
//! The nonce is deterministic (derived from the master key and page number)
//! so the transform needs no per-page bookkeeping, and the AAD is the
//! big-endian page number so ciphertext cannot be relocated.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use super::keys::MasterKey;
use super::Error;

pub const NONCE_BYTES: usize = 12;
pub const TAG_BYTES: usize = 16;
/// Constant per-page overhead of the transform.
pub const TRANSFORM_OVERHEAD: usize = NONCE_BYTES + TAG_BYTES;

pub struct PageCodec {
    key: MasterKey,
    cipher: Aes256Gcm,
}

impl PageCodec {
    pub fn new(key: MasterKey) -> PageCodec {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .expect("AES-256 key is exactly 32 bytes");
        PageCodec { key, cipher }
    }

    pub fn key(&self) -> &MasterKey {
        &self.key
    }

    /// The on-disk size of a page of `raw` plaintext bytes.
    pub fn transformed_page_size(raw: usize) -> usize {
        raw + TRANSFORM_OVERHEAD
    }

    /// Encrypt `plain` for `page_number` into a transformed block.
    pub fn transform_write(&self, plain: &[u8], page_number: u32) -> Result<Vec<u8>, Error> {
        let nonce = self.key.page_nonce(page_number);
        let aad = page_number.to_be_bytes();
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plain,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::TagMismatch(page_number))?;
        let mut out = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a transformed block read from `page_number`'s slot.
    ///
    /// Fails with a tag mismatch on tampered ciphertext, a wrong key, or a
    /// block that was written for a different page number.
    pub fn transform_read(&self, block: &[u8], page_number: u32) -> Result<Vec<u8>, Error> {
        if block.len() < TRANSFORM_OVERHEAD {
            return Err(Error::WrongLength);
        }
        let (nonce, ciphertext) = block.split_at(NONCE_BYTES);
        let aad = page_number.to_be_bytes();
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| Error::TagMismatch(page_number))
    }
}
