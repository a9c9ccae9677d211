//! The rollback journal: a sibling file holding pre-images of pages a
//! transaction is about to overwrite.  Its absence is the commit witness.
//!
//! The layout is self-compatible (this module both writes and replays it)
//! and follows the shape of SQLite's rollback journal: a fixed header, then
//! one `(page_number, pre_image, checksum)` record per captured page.  Each
//! page is captured exactly once per transaction, before the first time it
//! is dirtied.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::info;

use crate::pager::PageNum;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Journal: error accessing journal file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Journal: the journal file is malformed.")]
    Malformed,
    #[error("Journal: record checksum mismatch at page {0}.")]
    BadChecksum(PageNum),
}

const JOURNAL_MAGIC: [u8; 8] = [0xd9, 0xd5, 0x05, 0xf9, 0x20, 0xa1, 0x63, 0xd7];
// Header layout: magic(8) record_count(4) nonce(4) orig_page_count(4)
// sector_size(4) page_size(4) = 28 bytes, records follow immediately.
const RECORD_COUNT_OFFSET: u64 = 8;

/// Journal placement: on disk next to the database (crash safe) or held in
/// memory (test use only; a crash loses the transaction's pre-images).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    #[default]
    Delete,
    Memory,
}

/// Derive the journal path for a database path.
pub fn journal_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push(".journal");
    PathBuf::from(os)
}

/// Per-record checksum: additive over every 200th byte of the pre-image,
/// seeded by the journal nonce.
fn checksum(nonce: u32, pre_image: &[u8]) -> u32 {
    let mut sum = nonce;
    let mut i = 0;
    while i < pre_image.len() {
        sum = sum.wrapping_add(pre_image[i] as u32);
        i += 200;
    }
    sum
}

enum Backing {
    File { file: File, path: PathBuf },
    Memory,
}

/// An open journal for one write transaction.
pub struct Journal {
    backing: Backing,
    page_size: u32,
    nonce: u32,
    original_page_count: u32,
    captured: HashSet<PageNum>,
    record_count: u32,
}

impl Journal {
    /// Create the journal and write its header.
    pub fn create(
        db_path: &Path,
        mode: JournalMode,
        page_size: u32,
        original_page_count: u32,
    ) -> Result<Journal, Error> {
        // A fixed nonce seed keeps the format deterministic enough to test;
        // mixing in the page count varies it between transactions.
        let nonce = 0x5348_4152u32 ^ original_page_count;
        let backing = match mode {
            JournalMode::Memory => Backing::Memory,
            JournalMode::Delete => {
                let path = journal_path(db_path);
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&path)?;
                file.write_all(&JOURNAL_MAGIC)?;
                file.write_u32::<BigEndian>(0)?; // record count, patched by sync
                file.write_u32::<BigEndian>(nonce)?;
                file.write_u32::<BigEndian>(original_page_count)?;
                file.write_u32::<BigEndian>(512)?; // sector size
                file.write_u32::<BigEndian>(page_size)?;
                Backing::File { file, path }
            }
        };
        Ok(Journal {
            backing,
            page_size,
            nonce,
            original_page_count,
            captured: HashSet::new(),
            record_count: 0,
        })
    }

    pub fn original_page_count(&self) -> u32 {
        self.original_page_count
    }

    /// Whether `pn` already has a pre-image in this journal.
    pub fn contains(&self, pn: PageNum) -> bool {
        self.captured.contains(&pn)
    }

    /// Record the pre-image of page `pn`.  Later captures of the same page
    /// are ignored; the first image of the transaction is the one rollback
    /// wants.
    pub fn capture(&mut self, pn: PageNum, pre_image: &[u8]) -> Result<(), Error> {
        if !self.captured.insert(pn) {
            return Ok(());
        }
        debug_assert_eq!(pre_image.len(), self.page_size as usize);
        if let Backing::File { file, .. } = &mut self.backing {
            file.seek(SeekFrom::End(0))?;
            file.write_u32::<BigEndian>(pn as u32)?;
            file.write_all(pre_image)?;
            file.write_u32::<BigEndian>(checksum(self.nonce, pre_image))?;
        }
        self.record_count += 1;
        Ok(())
    }

    /// Make every captured pre-image durable.  Must complete before the
    /// first in-place page write of the commit.
    pub fn sync(&mut self) -> Result<(), Error> {
        if let Backing::File { file, .. } = &mut self.backing {
            file.seek(SeekFrom::Start(RECORD_COUNT_OFFSET))?;
            file.write_u32::<BigEndian>(self.record_count)?;
            file.sync_all()?;
        }
        Ok(())
    }

    /// Remove the journal; this is what makes the commit (or the rollback)
    /// final.
    pub fn delete(self) -> Result<(), Error> {
        if let Backing::File { file, path } = self.backing {
            drop(file);
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// A journal parsed back from disk during crash recovery.
pub struct RecoveredJournal {
    pub page_size: u32,
    pub original_page_count: u32,
    pub pre_images: Vec<(PageNum, Vec<u8>)>,
}

/// Parse a journal file.  Records past the durable record count (a crash
/// while capturing) are ignored.
pub fn read_journal(path: &Path) -> Result<RecoveredJournal, Error> {
    let file = File::open(path)?;
    let mut r = BufReader::new(file);
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).map_err(|_| Error::Malformed)?;
    if magic != JOURNAL_MAGIC {
        return Err(Error::Malformed);
    }
    let record_count = r.read_u32::<BigEndian>().map_err(|_| Error::Malformed)?;
    let nonce = r.read_u32::<BigEndian>().map_err(|_| Error::Malformed)?;
    let original_page_count = r.read_u32::<BigEndian>().map_err(|_| Error::Malformed)?;
    let _sector = r.read_u32::<BigEndian>().map_err(|_| Error::Malformed)?;
    let page_size = r.read_u32::<BigEndian>().map_err(|_| Error::Malformed)?;
    if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(Error::Malformed);
    }

    let mut pre_images = Vec::with_capacity(record_count as usize);
    for _ in 0..record_count {
        let pn = r.read_u32::<BigEndian>().map_err(|_| Error::Malformed)? as PageNum;
        let mut image = vec![0u8; page_size as usize];
        r.read_exact(&mut image).map_err(|_| Error::Malformed)?;
        let stored = r.read_u32::<BigEndian>().map_err(|_| Error::Malformed)?;
        if stored != checksum(nonce, &image) {
            return Err(Error::BadChecksum(pn));
        }
        pre_images.push((pn, image));
    }
    info!(
        "journal: recovered {} pre-image(s), original page count {}",
        pre_images.len(),
        original_page_count
    );
    Ok(RecoveredJournal {
        page_size,
        original_page_count,
        pre_images,
    })
}
