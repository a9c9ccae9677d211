//! Page-level authenticated encryption.
//!
//! An encrypted database file is a 128-byte encryption header followed by
//! one fixed-size block per logical page.  Each block is
//! `nonce(12) || ciphertext || tag(16)`, AES-256-GCM, with the page number
//! bound in as additional authenticated data so a block cannot be moved to
//! a different page without failing authentication.

pub mod header;
pub mod keys;
pub mod page;

pub use header::EncryptionHeader;
pub use keys::MasterKey;
pub use page::PageCodec;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("The password does not match this database.")]
    BadPassword,
    #[error("Page {0}: authentication tag mismatch.")]
    TagMismatch(u32),
    #[error("The encryption header is malformed.")]
    MalformedHeader,
    #[error("The file uses an algorithm this build does not implement: {0}.")]
    UnsupportedAlgorithm(&'static str),
    #[error("Buffer length does not match the page transform geometry.")]
    WrongLength,
}
