//! Defines the `Database` type, which represents one disk-backed database
//! file.
//!
//! Opening inspects the first bytes of the file: the encryption magic
//! selects the decrypting page substrate (logical page 1 then lives at
//! file offset 128), otherwise the SQLite magic is required.  A leftover
//! rollback journal is replayed before anything else reads the file, then
//! the schema catalog is parsed from page 1.
//!
//! A `Database` owns its page cache, lock coordinator and key handle;
//! none of them are shared between databases, and the catalog is
//! per-database state rebuilt on open and after DDL commits.

use std::fs::OpenOptions;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::info;
use zeroize::Zeroizing;

use crate::btree::{self, cell, header as btree_header, payload, PageType};
use crate::crypto::{
    self,
    header::{CipherAlgorithm, EncryptionHeader, KdfAlgorithm, ENCRYPTION_HEADER_BYTES},
    MasterKey, PageCodec,
};
use crate::dbheader::{self, DbfileHeader, SQLITE_DB_HEADER_BYTES};
use crate::filter::Filter;
use crate::journal::{self, journal_path, JournalMode};
use crate::locks::LockCoordinator;
use crate::pager::{PageNum, Pager, DEFAULT_CACHE_SIZE_PAGES};
use crate::reader::Reader;
use crate::schema::{self, Schema, SCHEMA_BTREE_ROOT_PAGENUM};
use crate::shadow::ShadowPageSource;
use crate::writer::{Transaction, TransactionError};
use crate::Error;

/// The recognized open/create options.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub page_size: u32,
    pub cache_size_pages: usize,
    pub writable: bool,
    pub password: Option<String>,
    /// Key-derivation parameters, honoured at create time; at open time
    /// they come from the stored encryption header.
    pub kdf_time_cost: u32,
    pub kdf_memory_kib: u32,
    pub kdf_parallelism: u32,
    pub journal_mode: JournalMode,
    pub lock_timeout: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> DatabaseOptions {
        DatabaseOptions {
            page_size: 4096,
            cache_size_pages: DEFAULT_CACHE_SIZE_PAGES,
            writable: false,
            password: None,
            kdf_time_cost: 1,
            kdf_memory_kib: 65536,
            kdf_parallelism: 1,
            journal_mode: JournalMode::Delete,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl DatabaseOptions {
    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn cache_size_pages(mut self, slots: usize) -> Self {
        self.cache_size_pages = slots;
        self
    }

    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn kdf_time_cost(mut self, cost: u32) -> Self {
        self.kdf_time_cost = cost;
        self
    }

    pub fn journal_mode(mut self, mode: JournalMode) -> Self {
        self.journal_mode = mode;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn validate(&self) -> Result<(), Error> {
        if !(512..=65536).contains(&self.page_size) || !self.page_size.is_power_of_two() {
            return Err(dbheader::Error::UnsupportedPagesize.into());
        }
        Ok(())
    }
}

/// The result of a `verify_integrity` traversal; consumed by the trust
/// ledger, which folds the raw walk into its own hash-chain validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub trees_checked: usize,
    pub pages_visited: u64,
    pub max_depth: usize,
    pub freelist_pages: u32,
}

pub struct Database {
    path: PathBuf,
    pager: Pager,
    schema: Schema,
    locks: LockCoordinator,
    options: DatabaseOptions,
    /// File change counter as of our last look at page 1; a mismatch means
    /// another process committed and our cache and catalog are stale.
    change_counter: std::cell::Cell<u32>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Database {
    /// Create a fresh database file.  With a password set the file starts
    /// with the 128-byte encryption header and every page is transformed.
    pub fn create(path: impl AsRef<Path>, options: DatabaseOptions) -> Result<Database, Error> {
        let path = path.as_ref();
        options.validate()?;
        let mut options = options;
        options.writable = true;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let codec = match &options.password {
            Some(password) => {
                let mut salt = [0u8; 32];
                getrandom::getrandom(&mut salt)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
                let key = MasterKey::derive(password, &salt, options.kdf_time_cost);
                let enc_header = EncryptionHeader {
                    kdf: KdfAlgorithm::Pbkdf2Sha512,
                    cipher: CipherAlgorithm::Aes256Gcm,
                    kdf_time_cost: options.kdf_time_cost,
                    kdf_memory_kib: options.kdf_memory_kib,
                    kdf_parallelism: options.kdf_parallelism,
                    salt,
                    verification_mac: key.verification_mac(),
                    inner_page_size: options.page_size,
                    inner_page_count: 1,
                };
                use std::io::Write;
                file.write_all(&enc_header.serialize())?;
                Some(PageCodec::new(key))
            }
            None => None,
        };

        let pager = Pager::from_file(
            file,
            options.page_size,
            0,
            true,
            codec,
            options.cache_size_pages,
        );
        pager.extend(1)?;
        let mut page1 = vec![0u8; options.page_size as usize];
        dbheader::write_header(&DbfileHeader::new(options.page_size), &mut page1);
        btree_header::write_header(
            &btree_header::PageHeader::empty(PageType::TableLeaf, options.page_size),
            &mut page1,
            1,
        );
        pager.write_page(1, &page1)?;
        pager.flush()?;

        let locks = LockCoordinator::new(path)?;
        Ok(Database {
            path: path.to_path_buf(),
            pager,
            schema: Schema::default(),
            locks,
            options,
            change_counter: std::cell::Cell::new(1),
        })
    }

    /// Open an existing database, replaying any leftover rollback journal
    /// first.
    pub fn open(path: impl AsRef<Path>, options: DatabaseOptions) -> Result<Database, Error> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(options.writable)
            .open(path)?;

        let mut prefix = [0u8; 16];
        let prefix_len = file.read(&mut prefix)?;

        let (page_size, codec) = if EncryptionHeader::sniff(&prefix[..prefix_len]) {
            let mut header_bytes = vec![0u8; ENCRYPTION_HEADER_BYTES];
            use std::io::{Seek, SeekFrom};
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header_bytes)
                .map_err(|_| crypto::Error::MalformedHeader)?;
            let enc_header = EncryptionHeader::parse(&header_bytes)?;
            let password = options
                .password
                .as_deref()
                .ok_or(crypto::Error::BadPassword)?;
            let key = MasterKey::derive(password, &enc_header.salt, enc_header.kdf_time_cost);
            key.verify(&enc_header.verification_mac)?;
            (enc_header.inner_page_size, Some(PageCodec::new(key)))
        } else {
            use std::io::{Seek, SeekFrom};
            file.seek(SeekFrom::Start(0))?;
            let mut header_bytes = vec![0u8; SQLITE_DB_HEADER_BYTES];
            file.read_exact(&mut header_bytes)
                .map_err(|_| dbheader::Error::WrongMagic)?;
            let header = dbheader::parse_header(&header_bytes)?;
            (header.pagesize, None)
        };

        // The raw extent bounds the page count until the (possibly
        // encrypted) header on page 1 is readable.
        let file_len = file.metadata()?.len();
        let block = match &codec {
            Some(_) => page_size as u64 + crypto::page::TRANSFORM_OVERHEAD as u64,
            None => page_size as u64,
        };
        let base = match &codec {
            Some(_) => ENCRYPTION_HEADER_BYTES as u64,
            None => 0,
        };
        let extent_pages = ((file_len.saturating_sub(base)) / block) as u32;
        if extent_pages == 0 {
            return Err(dbheader::Error::Invalid.into());
        }

        let pager = Pager::from_file(
            file,
            page_size,
            extent_pages,
            options.writable,
            codec,
            options.cache_size_pages,
        );

        // Crash recovery: a valid sibling journal means the last commit
        // never finished; restore pre-images before anything reads.
        let jpath = journal_path(path);
        if jpath.exists() {
            if !options.writable {
                return Err(TransactionError::HotJournal.into());
            }
            Self::replay_journal(path, &jpath, &pager, &options)?;
        }

        let page1 = pager.get_page(1)?;
        let header = dbheader::parse_header(&page1)?;
        if header.pagesize != page_size {
            return Err(dbheader::Error::Invalid.into());
        }
        if header.numpages > extent_pages {
            return Err(dbheader::Error::Invalid.into());
        }
        drop(page1);
        pager.set_page_count(header.numpages);

        let schema = Schema::load(&pager)?;
        let locks = LockCoordinator::new(path)?;
        Ok(Database {
            path: path.to_path_buf(),
            pager,
            schema,
            locks,
            options,
            change_counter: std::cell::Cell::new(header.changecnt),
        })
    }

    fn replay_journal(
        db_path: &Path,
        jpath: &Path,
        pager: &Pager,
        options: &DatabaseOptions,
    ) -> Result<(), Error> {
        // Exclusive access while restoring; another process may be mid-
        // recovery on the same file.
        let locks = LockCoordinator::new(db_path)?;
        let _guard = locks.exclusive(options.lock_timeout)?;
        if !jpath.exists() {
            return Ok(());
        }
        let recovered = journal::read_journal(jpath)?;
        if recovered.page_size != pager.page_size() {
            return Err(journal::Error::Malformed.into());
        }
        info!(
            "recovering {}: journal with {} pre-image(s)",
            db_path.display(),
            recovered.pre_images.len()
        );
        if recovered.original_page_count > pager.page_count() {
            pager.extend(recovered.original_page_count - pager.page_count())?;
        }
        for (pn, image) in &recovered.pre_images {
            pager.write_page(*pn, image)?;
        }
        if recovered.original_page_count < pager.page_count() {
            pager.truncate(recovered.original_page_count)?;
        }
        pager.flush()?;
        std::fs::remove_file(jpath)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The catalog as of open or the last committed transaction.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn is_encrypted(&self) -> bool {
        self.pager.is_encrypted()
    }

    /// The header's file change counter; increases with every commit, so
    /// observers can cheaply poll for changes.
    pub fn data_version(&self) -> Result<u32, Error> {
        let page1 = self.pager.get_page(1)?;
        Ok(dbheader::parse_header(&page1)?.changecnt)
    }

    /// Derive the 32-byte row-level subkey for an entitlement tag.  Equal
    /// `(master key, tag)` pairs always produce equal subkeys.
    pub fn row_key(&self, entitlement_tag: &str) -> Result<Zeroizing<[u8; 32]>, Error> {
        let codec = self
            .pager
            .codec()
            .ok_or(crypto::Error::BadPassword)?;
        Ok(codec.key().row_key(entitlement_tag))
    }

    /// A reader over every row of `table`.
    pub fn create_reader(&self, table: &str) -> Result<Reader<'_>, Error> {
        self.create_reader_with_filter(table, &Filter::new())
    }

    /// A reader over the rows of `table` matching `filter`.  An equality
    /// predicate on an indexed column is served through the index.
    pub fn create_reader_with_filter(
        &self,
        table: &str,
        filter: &Filter,
    ) -> Result<Reader<'_>, Error> {
        let t = self
            .schema
            .table(table)
            .cloned()
            .ok_or_else(|| schema::Error::TableNotFound(table.to_string()))?;
        let indexes: Vec<schema::IndexSchema> = self.schema.indexes_on(table).cloned().collect();
        let lock = self.locks.shared(self.options.lock_timeout)?;
        Ok(Reader::new(&self.pager, t, filter, &indexes, Some(lock))?)
    }

    /// A reader yielding only the named columns of `table`, in the given
    /// order.
    pub fn create_reader_with_columns(
        &self,
        table: &str,
        columns: &[&str],
    ) -> Result<Reader<'_>, Error> {
        Ok(self.create_reader(table)?.with_columns(columns)?)
    }

    /// A reader prepared for `seek_key` point lookups through `index`.
    pub fn create_index_reader(&self, index: &str) -> Result<Reader<'_>, Error> {
        let i = self
            .schema
            .index(index)
            .cloned()
            .ok_or_else(|| schema::Error::IndexNotFound(index.to_string()))?;
        let t = self
            .schema
            .table(&i.table)
            .cloned()
            .ok_or_else(|| schema::Error::TableNotFound(i.table.clone()))?;
        let lock = self.locks.shared(self.options.lock_timeout)?;
        Ok(Reader::new(&self.pager, t, &Filter::new(), &[], Some(lock))?.with_index(i))
    }

    /// Begin the single write transaction.  Takes the exclusive lock and
    /// opens the rollback journal; the lock is held until `commit` or
    /// `rollback`.
    pub fn begin_transaction(&mut self) -> Result<Transaction<'_>, Error> {
        if !self.options.writable {
            return Err(TransactionError::ReadOnly.into());
        }
        let lock = self.locks.exclusive(self.options.lock_timeout)?;

        // Another process may have committed since our last look; page 1's
        // change counter is the cheap tell.
        self.pager.invalidate(1);
        let header = {
            let page1 = self.pager.get_page(1)?;
            dbheader::parse_header(&page1)?
        };
        if header.changecnt != self.change_counter.get() {
            self.pager.invalidate_all();
            self.pager.set_page_count(header.numpages);
            self.schema = Schema::load(&self.pager)?;
            self.change_counter.set(header.changecnt);
        }

        let journal = journal::Journal::create(
            &self.path,
            self.options.journal_mode,
            self.pager.page_size(),
            header.numpages,
        )?;
        let shadow = ShadowPageSource::new(&self.pager, journal);
        Ok(Transaction::begin(
            &mut self.schema,
            shadow,
            header,
            lock,
            &self.change_counter,
        ))
    }

    /// Walk every btree and the freelist, checking structural invariants.
    /// The trust ledger drives this raw traversal to validate its own
    /// hash chain.
    pub fn verify_integrity(&self) -> Result<IntegrityReport, Error> {
        let mut report = IntegrityReport::default();
        let header = {
            let page1 = self.pager.get_page(1)?;
            dbheader::parse_header(&page1)?
        };

        let mut roots: Vec<PageNum> = vec![SCHEMA_BTREE_ROOT_PAGENUM];
        roots.extend(self.schema.tables.iter().map(|t| t.root_page));
        roots.extend(self.schema.indexes.iter().map(|i| i.root_page));
        for root in roots {
            let depth = self.check_tree(root, &mut report.pages_visited, None, None)?;
            report.max_depth = report.max_depth.max(depth);
            report.trees_checked += 1;
        }

        // Freelist: total count equals trunks plus the sum of leaf counts.
        let mut walked = 0u32;
        let mut trunk = header.freelist_head as PageNum;
        while trunk != 0 {
            let page = self.pager.get_page(trunk)?;
            walked += 1 + BigEndian::read_u32(&page[4..8]);
            trunk = BigEndian::read_u32(&page[0..4]) as PageNum;
            if walked > header.numpages {
                return Err(btree::Error::CorruptPage {
                    page: trunk,
                    reason: "freelist chain longer than the database",
                }
                .into());
            }
        }
        if walked != header.freelist_count {
            return Err(btree::Error::CorruptPage {
                page: header.freelist_head as PageNum,
                reason: "freelist count disagrees with the trunk chain",
            }
            .into());
        }
        report.freelist_pages = walked;
        Ok(report)
    }

    /// Depth-first structural check of one btree: header sanity, divider
    /// bounds on table trees, and full overflow-chain assembly.
    fn check_tree(
        &self,
        pn: PageNum,
        pages: &mut u64,
        min_rowid: Option<i64>,
        max_rowid: Option<i64>,
    ) -> Result<usize, Error> {
        *pages += 1;
        let page = self.pager.get_page(pn)?;
        let hdr = btree_header::parse_header(&page, pn)?;
        let usable = self.pager.page_size();

        let mut last_rowid: Option<i64> = None;
        let mut depth = 1usize;
        for i in 0..hdr.num_cells as usize {
            let ptr = btree_header::cell_pointer(&page, &hdr, pn, i);
            let c = cell::parse_cell(&page[ptr..], hdr.page_type, usable, pn)?;
            if let Some(rowid) = c.rowid {
                if hdr.page_type.is_table() {
                    if let Some(prev) = last_rowid {
                        if prev >= rowid {
                            return Err(btree::Error::CorruptPage {
                                page: pn,
                                reason: "cells out of rowid order",
                            }
                            .into());
                        }
                    }
                    if min_rowid.is_some_and(|lo| rowid <= lo)
                        || max_rowid.is_some_and(|hi| rowid > hi)
                    {
                        return Err(btree::Error::CorruptPage {
                            page: pn,
                            reason: "rowid outside its parent's bounds",
                        }
                        .into());
                    }
                    last_rowid = Some(rowid);
                }
            }
            if c.overflow_page.is_some() {
                // Assembling validates chain length and termination.
                payload::assemble(
                    &self.pager,
                    c.payload_size,
                    c.inline_payload,
                    c.overflow_page,
                    pn,
                )?;
            }
            if let Some(child) = c.left_child {
                let lo = if i == 0 { min_rowid } else { last_child_bound(&page, &hdr, pn, i - 1, usable)? };
                let child_depth =
                    self.check_tree(child as PageNum, pages, lo, c.rowid.or(max_rowid))?;
                depth = depth.max(1 + child_depth);
            }
        }
        if let Some(rmp) = hdr.rightmost_pointer {
            let lo = if hdr.num_cells == 0 {
                min_rowid
            } else {
                last_child_bound(&page, &hdr, pn, hdr.num_cells as usize - 1, usable)?
            };
            let child_depth = self.check_tree(rmp as PageNum, pages, lo, max_rowid)?;
            depth = depth.max(1 + child_depth);
        }
        Ok(depth)
    }
}

/// The divider rowid of cell `i`, used as the lower bound of the next
/// child (table trees only).
fn last_child_bound(
    page: &[u8],
    hdr: &btree_header::PageHeader,
    pn: PageNum,
    i: usize,
    usable: u32,
) -> Result<Option<i64>, Error> {
    if !hdr.page_type.is_table() {
        return Ok(None);
    }
    let ptr = btree_header::cell_pointer(page, hdr, pn, i);
    let c = cell::parse_cell(&page[ptr..], hdr.page_type, usable, pn)?;
    Ok(c.rowid)
}
