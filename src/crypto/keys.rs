//! Key material handling.
//!
//! The master key lives in a zero-on-drop buffer of exactly 32 bytes and
//! never leaves this module except as `&[u8; 32]`.  Derivation from a
//! password is PBKDF2-SHA512 over the stored salt; Argon2id is reserved in
//! the header for a future build (see `header::KdfAlgorithm`).

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha2::{Sha256, Sha512};
use zeroize::Zeroizing;

use super::Error;

/// Baseline PBKDF2 round count; multiplied by the configured time cost.
pub const PBKDF2_BASE_ITERATIONS: u32 = 100_000;

/// The fixed constant the verification HMAC is computed over.
const VERIFICATION_CONSTANT: &[u8] = b"sharc:key-verification:v1";

/// HKDF info string for row-level subkeys.
const ROW_KEY_INFO: &[u8] = b"SHARC_ROW_v1";

/// A pinned, zero-on-drop 32-byte master key.
pub struct MasterKey {
    key: Zeroizing<[u8; 32]>,
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; 32]) -> MasterKey {
        MasterKey {
            key: Zeroizing::new(bytes),
        }
    }

    /// Derive a key from a password with PBKDF2-SHA512.
    pub fn derive(password: &str, salt: &[u8; 32], time_cost: u32) -> MasterKey {
        let iterations = PBKDF2_BASE_ITERATIONS.saturating_mul(time_cost.max(1));
        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, iterations, key.as_mut());
        MasterKey { key }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }

    fn hmac_sha256(&self, data: &[u8]) -> [u8; 32] {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.key.as_ref())
            .expect("HMAC accepts any key length");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// The verification MAC written into the encryption header at create
    /// time and checked at open.
    pub fn verification_mac(&self) -> [u8; 32] {
        self.hmac_sha256(VERIFICATION_CONSTANT)
    }

    /// Check a stored verification MAC; wrong passwords land here.
    pub fn verify(&self, stored: &[u8; 32]) -> Result<(), Error> {
        // Constant-time comparison via the Mac verify path.
        let mut mac = Hmac::<Sha256>::new_from_slice(self.key.as_ref())
            .expect("HMAC accepts any key length");
        mac.update(VERIFICATION_CONSTANT);
        mac.verify_slice(stored).map_err(|_| Error::BadPassword)
    }

    /// Deterministic per-page nonce: the first 12 bytes of
    /// HMAC-SHA256(master_key, BE32(page_number)).
    pub fn page_nonce(&self, page_number: u32) -> [u8; 12] {
        let mac = self.hmac_sha256(&page_number.to_be_bytes());
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&mac[..12]);
        nonce
    }

    /// Row-level subkey for an entitlement tag:
    /// HKDF-SHA256(ikm = master_key, salt = tag bytes, info = "SHARC_ROW_v1").
    /// Equal `(key, tag)` pairs always produce equal subkeys.
    pub fn row_key(&self, entitlement_tag: &str) -> Zeroizing<[u8; 32]> {
        let hk = Hkdf::<Sha256>::new(Some(entitlement_tag.as_bytes()), self.key.as_ref());
        let mut okm = Zeroizing::new([0u8; 32]);
        hk.expand(ROW_KEY_INFO, okm.as_mut())
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        okm
    }
}
