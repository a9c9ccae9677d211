//! The 128-byte encryption header at the start of an encrypted database
//! file.  Logical page 1 (which carries the SQLite header) begins at file
//! offset 128; the page codec translates addresses accordingly.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};

use super::Error;

pub const ENCRYPTION_HEADER_BYTES: usize = 128;
pub const ENCRYPTION_MAGIC: &[u8] = b"SHARC\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfAlgorithm {
    /// PBKDF2-SHA512, iterations = 100 000 x time cost.
    Pbkdf2Sha512,
    /// Reserved; the memory/parallelism fields exist for it.  Opening a
    /// file that advertises it fails with `UnsupportedAlgorithm`.
    Argon2id,
}

impl KdfAlgorithm {
    fn code(self) -> u8 {
        match self {
            KdfAlgorithm::Pbkdf2Sha512 => 1,
            KdfAlgorithm::Argon2id => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes256Gcm,
}

impl CipherAlgorithm {
    fn code(self) -> u8 {
        match self {
            CipherAlgorithm::Aes256Gcm => 1,
        }
    }
}

// Header layout.  All integers big-endian.
//
// Offset   Size    Description
// 0        6       Magic "SHARC\0"
// 6        1       Format version (1)
// 7        1       KDF algorithm (1 = PBKDF2-SHA512, 2 = Argon2id)
// 8        1       Cipher algorithm (1 = AES-256-GCM)
// 9        3       Reserved, zero
// 12       4       KDF time cost
// 16       4       KDF memory (KiB; Argon2id only, stored regardless)
// 20       4       KDF parallelism (Argon2id only, stored regardless)
// 24       32      KDF salt
// 56       32      Key verification HMAC
// 88       4       Inner (plaintext) page size
// 92       4       Inner page count
// 96       32      Reserved, zero
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptionHeader {
    pub kdf: KdfAlgorithm,
    pub cipher: CipherAlgorithm,
    pub kdf_time_cost: u32,
    pub kdf_memory_kib: u32,
    pub kdf_parallelism: u32,
    pub salt: [u8; 32],
    pub verification_mac: [u8; 32],
    pub inner_page_size: u32,
    pub inner_page_count: u32,
}

const FORMAT_VERSION: u8 = 1;

impl EncryptionHeader {
    /// Whether `prefix` (the first 16 bytes of a file) announces an
    /// encrypted database.
    pub fn sniff(prefix: &[u8]) -> bool {
        prefix.len() >= ENCRYPTION_MAGIC.len() && prefix[..ENCRYPTION_MAGIC.len()] == *ENCRYPTION_MAGIC
    }

    pub fn parse(bytes: &[u8]) -> Result<EncryptionHeader, Error> {
        if bytes.len() < ENCRYPTION_HEADER_BYTES || !Self::sniff(bytes) {
            return Err(Error::MalformedHeader);
        }
        let mut c = Cursor::new(&bytes[ENCRYPTION_MAGIC.len()..]);
        let version = c.read_u8().map_err(|_| Error::MalformedHeader)?;
        if version != FORMAT_VERSION {
            return Err(Error::UnsupportedAlgorithm("header format version"));
        }
        let kdf = match c.read_u8().map_err(|_| Error::MalformedHeader)? {
            1 => KdfAlgorithm::Pbkdf2Sha512,
            2 => return Err(Error::UnsupportedAlgorithm("Argon2id")),
            _ => return Err(Error::UnsupportedAlgorithm("key derivation")),
        };
        let cipher = match c.read_u8().map_err(|_| Error::MalformedHeader)? {
            1 => CipherAlgorithm::Aes256Gcm,
            _ => return Err(Error::UnsupportedAlgorithm("cipher")),
        };
        let mut reserved = [0u8; 3];
        c.read_exact(&mut reserved).map_err(|_| Error::MalformedHeader)?;
        let kdf_time_cost = c.read_u32::<BigEndian>().map_err(|_| Error::MalformedHeader)?;
        let kdf_memory_kib = c.read_u32::<BigEndian>().map_err(|_| Error::MalformedHeader)?;
        let kdf_parallelism = c.read_u32::<BigEndian>().map_err(|_| Error::MalformedHeader)?;
        let mut salt = [0u8; 32];
        c.read_exact(&mut salt).map_err(|_| Error::MalformedHeader)?;
        let mut verification_mac = [0u8; 32];
        c.read_exact(&mut verification_mac)
            .map_err(|_| Error::MalformedHeader)?;
        let inner_page_size = c.read_u32::<BigEndian>().map_err(|_| Error::MalformedHeader)?;
        let inner_page_count = c.read_u32::<BigEndian>().map_err(|_| Error::MalformedHeader)?;
        if !(512..=65536).contains(&inner_page_size) || !inner_page_size.is_power_of_two() {
            return Err(Error::MalformedHeader);
        }
        Ok(EncryptionHeader {
            kdf,
            cipher,
            kdf_time_cost,
            kdf_memory_kib,
            kdf_parallelism,
            salt,
            verification_mac,
            inner_page_size,
            inner_page_count,
        })
    }

    pub fn serialize(&self) -> [u8; ENCRYPTION_HEADER_BYTES] {
        let mut out = [0u8; ENCRYPTION_HEADER_BYTES];
        let mut c = Cursor::new(&mut out[..]);
        c.write_all(ENCRYPTION_MAGIC).unwrap();
        c.write_u8(FORMAT_VERSION).unwrap();
        c.write_u8(self.kdf.code()).unwrap();
        c.write_u8(self.cipher.code()).unwrap();
        c.write_all(&[0u8; 3]).unwrap();
        c.write_u32::<BigEndian>(self.kdf_time_cost).unwrap();
        c.write_u32::<BigEndian>(self.kdf_memory_kib).unwrap();
        c.write_u32::<BigEndian>(self.kdf_parallelism).unwrap();
        c.write_all(&self.salt).unwrap();
        c.write_all(&self.verification_mac).unwrap();
        c.write_u32::<BigEndian>(self.inner_page_size).unwrap();
        c.write_u32::<BigEndian>(self.inner_page_count).unwrap();
        out
    }
}
