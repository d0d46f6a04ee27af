//! The embeddable handle: the one public entry point tying the page cache,
//! the b-tree engine, and the page-0 schema builder together into the
//! conceptual API of spec §6 (`put`/`put_record`/`get`/`get_record`/
//! `read_col`/`make_new_rec`/`flush`, plus a closing destructor).

use std::path::Path;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::physical::btree::{BTree, Key};
use crate::physical::cache::PageCache;
use crate::physical::codec::Value;
use crate::physical::page;
use crate::physical::record::{self, Record};
use crate::physical::schema::{self, TableDef};
use crate::physical::stats::Stats;

/// Allowed page sizes: every power of two SQLite itself accepts.
const VALID_PAGE_SIZES: [u32; 8] = [512, 1024, 2048, 4096, 8192, 16384, 32768, 65536];

pub struct Handle {
    cache: Option<PageCache>,
    root: u32,
    pk_col_count: usize,
    table: TableDef,
    stats: Stats,
}

impl Handle {
    /// Opens `path`, creating it (and writing a fresh page 0 plus an empty
    /// root) if it does not already exist. `columns` and `pk_col_count`
    /// describe the one `WITHOUT ROWID` table this handle writes; on an
    /// existing file they are trusted as the caller's own schema knowledge
    /// (this engine keeps no multi-table catalog to validate against, per
    /// the single-table scope of spec §1).
    pub fn open(
        path: impl AsRef<Path>,
        page_size: u32,
        cache_size_kb: u32,
        pk_col_count: usize,
        columns: Vec<String>,
        table_name: String,
    ) -> Result<Self> {
        if !VALID_PAGE_SIZES.contains(&page_size) {
            return Err(Error::InvalidPageSize(page_size));
        }
        if pk_col_count == 0 || pk_col_count > columns.len() {
            return Err(Error::Malformed(format!(
                "pk_col_count {pk_col_count} out of range for {} columns",
                columns.len()
            )));
        }

        let table = TableDef {
            table_name,
            columns,
            pk_col_count,
        };

        let exists = path.as_ref().exists();
        let (cache, root) = if exists {
            let mut cache = PageCache::open(
                &path,
                page_size,
                cache_size_kb,
                page::is_dirty,
                page::set_dirty,
                None,
            )?;
            schema::validate_header(cache.page0(), page_size)?;
            let master = schema::read_master(cache.page0())?;
            debug!("opened existing database, root page {}", master.root_page);
            (cache, master.root_page)
        } else {
            let page0 = schema::build_page0(page_size, page::RESERVED_BYTES as u8, &table)?;
            let mut cache = PageCache::open(
                &path,
                page_size,
                cache_size_kb,
                page::is_dirty,
                page::set_dirty,
                Some(page0),
            )?;
            crate::physical::btree::init_empty_root(&mut cache, schema::ROOT_PAGE, page_size)?;
            info!("created new database at {:?}, page_size={page_size}", path.as_ref());
            (cache, schema::ROOT_PAGE)
        };

        Ok(Self {
            cache: Some(cache),
            root,
            pk_col_count: table.pk_col_count,
            table,
            stats: Stats::default(),
        })
    }

    fn cache_mut(&mut self) -> Result<&mut PageCache> {
        self.cache.as_mut().ok_or(Error::Closed)
    }

    /// Packs `values` into a contiguous record buffer (thin wrapper over the
    /// codec's record builder, exposed so callers can build a row once and
    /// pass it to either [`Handle::put_record`] or [`Handle::get_record`]).
    pub fn make_new_rec(values: &[Value]) -> Vec<u8> {
        record::build(values)
    }

    /// Convenience insert for the common single-text-primary-key table:
    /// packs `(key, value)` as a two-column record and inserts it.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        if self.pk_col_count != 1 {
            return Err(Error::Malformed(
                "put(key, value) requires a single-column primary key; use put_record".into(),
            ));
        }
        let record = record::build(&[Value::Text(key), Value::Text(value)]);
        self.put_record(&record)
    }

    /// Inserts or updates an already-packed multi-column record. Returns
    /// whether a row with the same leading `pk_col_count` columns already
    /// existed and was replaced.
    pub fn put_record(&mut self, record: &[u8]) -> Result<bool> {
        let root = self.root;
        let pk_col_count = self.pk_col_count;
        let cache = self.cache_mut()?;
        let mut tree = BTree::new(cache, page::RESERVED_BYTES, pk_col_count, &mut self.stats);
        tree.put(root, record)
    }

    /// Convenience lookup paired with [`Handle::put`]: looks up `key` against
    /// the first column and, on a hit, copies the second column's bytes into
    /// `out`.
    pub fn get(&mut self, key: &[u8], out: &mut Vec<u8>) -> Result<bool> {
        if self.pk_col_count != 1 {
            return Err(Error::Malformed(
                "get(key) requires a single-column primary key; use get_record".into(),
            ));
        }
        let root = self.root;
        let pk_col_count = self.pk_col_count;
        let cache = self.cache_mut()?;
        let mut tree = BTree::new(cache, page::RESERVED_BYTES, pk_col_count, &mut self.stats);
        match tree.get(root, &Key::Prefix(key))? {
            Some(bytes) => {
                let record = Record::new(&bytes)?;
                match record.column(1)? {
                    Value::Text(v) | Value::Blob(v) => {
                        out.clear();
                        out.extend_from_slice(v);
                        Ok(true)
                    }
                    other => Err(Error::TypeMismatch(format!(
                        "put/get's value column decoded as {other:?}, expected text/blob"
                    ))),
                }
            }
            None => Ok(false),
        }
    }

    /// General lookup: `key_record` must be a packed record whose leading
    /// `pk_col_count` columns are the search key (trailing columns, if any,
    /// are ignored). On a hit, copies the full matching row into `out`.
    pub fn get_record(&mut self, key_record: &[u8], out: &mut Vec<u8>) -> Result<bool> {
        let root = self.root;
        let pk_col_count = self.pk_col_count;
        let cache = self.cache_mut()?;
        let mut tree = BTree::new(cache, page::RESERVED_BYTES, pk_col_count, &mut self.stats);
        match tree.get(root, &Key::Record(key_record))? {
            Some(bytes) => {
                out.clear();
                out.extend_from_slice(&bytes);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Decodes column `which` out of a packed `record` and writes its
    /// content bytes into `out`, returning the number of bytes written.
    /// Integers and reals are written as an 8-byte big-endian representation
    /// (the native fixed width codec already uses for int64 slots and
    /// REAL); text and blob are copied as their raw bytes; `NULL` writes
    /// nothing and returns 0.
    pub fn read_col(which: usize, record: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let record = Record::new(record)?;
        let value = record.column(which)?;
        out.clear();
        match value {
            Value::Null => Ok(0),
            Value::Int(v) => {
                out.extend_from_slice(&v.to_be_bytes());
                Ok(8)
            }
            Value::Real(v) => {
                out.extend_from_slice(&v.to_bits().to_be_bytes());
                Ok(8)
            }
            Value::Text(bytes) | Value::Blob(bytes) => {
                out.extend_from_slice(bytes);
                Ok(bytes.len())
            }
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        self.cache_mut()?.flush()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Flushes every dirty frame, patches the file header's page-count field
    /// to the file's final size, and releases the backing file. Consuming
    /// `self` makes a second use of the handle a compile error rather than a
    /// `Closed` runtime error; [`Drop`] calls the same path for handles that
    /// go out of scope without an explicit close.
    pub fn close(mut self) -> Result<()> {
        self.close_internal()
    }

    fn close_internal(&mut self) -> Result<()> {
        if let Some(mut cache) = self.cache.take() {
            schema::set_page_count(cache.page0_mut(), cache.file_page_count());
            self.stats.log_summary(cache.requests(), cache.misses());
            cache.close()?;
        }
        Ok(())
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.cache.is_some() {
            if let Err(e) = self.close_internal() {
                log::error!("error closing handle on drop: {e}");
            }
        }
    }
}
