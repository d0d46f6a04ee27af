//! The page cache: the single gateway between the B-tree and the backing
//! file. Mediates all disk I/O, tracks recency for eviction, and batches
//! flush so a `put` does not pay for a write per touched page.
//!
//! Dirtiness is not tracked here — per the file format's own design, the bit
//! lives inside the page (see [`crate::physical::page::is_dirty`]), so a page
//! reloaded after eviction carries its dirty state with it. The cache is
//! handed the predicate/setter as function pointers at construction and
//! stays oblivious to page layout.

use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::physical::page;

const MIN_BATCH: usize = 2;
const MAX_BATCH: usize = 500;

/// Reads the dirty bit out of a page buffer (page 0's file-header prefix
/// doesn't change this: the bit lives in the trailing reserved byte).
pub type DirtyPredicate = fn(&[u8], usize) -> bool;
pub type DirtySetter = fn(&mut [u8], usize, bool);

/// Page-1-sized sentinel meaning "no frame" in the recency linked list.
const NIL: usize = usize::MAX;

pub struct PageCache {
    file: File,
    page_size: u32,
    capacity: usize,

    frames: Vec<Vec<u8>>,
    /// Disk page number resident in each frame, or 0 if the frame is unused.
    frame_page: Vec<u32>,
    disk_to_frame: HashMap<u32, usize>,

    /// Doubly linked recency list over frame indices. `mru`/`lru` are list
    /// ends; `NIL` marks "no neighbor".
    prev: Vec<usize>,
    next: Vec<usize>,
    mru: usize,
    lru: usize,

    /// Cursor into the recency list, set to the tail of the still-clean
    /// region after a flush, so the next eviction doesn't re-scan pages it
    /// already knows are dirty.
    last_free: usize,

    /// Page numbers whose very first on-disk write is still pending; these
    /// must reach disk in ascending order so the file never develops a hole.
    newly_allocated: BTreeSet<u32>,

    file_page_count: u32,

    /// Page 0 (the 100-byte file header plus the `sqlite_master` leaf) is
    /// always resident; its special layout must never be mixed into normal
    /// frame handling.
    page0: Vec<u8>,
    page0_dirty: bool,

    is_changed: DirtyPredicate,
    mark_changed: DirtySetter,

    batch_size: usize,
    requests: u64,
    misses: u64,
}

impl PageCache {
    /// Opens (or creates) the backing file. `page0` is the already-built
    /// 100-byte header + `sqlite_master` leaf for a new file, or `None` to
    /// read it from an existing one.
    pub fn open(
        path: impl AsRef<Path>,
        page_size: u32,
        cache_kb: u32,
        is_changed: DirtyPredicate,
        mark_changed: DirtySetter,
        initial_page0: Option<Vec<u8>>,
    ) -> Result<Self> {
        if !page_size.is_power_of_two() || !(512..=65536).contains(&page_size) {
            return Err(Error::InvalidPageSize(page_size));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(initial_page0.is_some())
            .open(path)?;

        let file_len = file.metadata()?.len();
        let mut file_page_count = (file_len / page_size as u64) as u32;

        let (page0, newly_allocated) = match initial_page0 {
            Some(page0) => {
                file_page_count = file_page_count.max(1);
                let mut newly_allocated = BTreeSet::new();
                newly_allocated.insert(1);
                (page0, newly_allocated)
            }
            None => {
                let mut buf = vec![0u8; page_size as usize];
                file.seek(SeekFrom::Start(0))?;
                file.read_exact(&mut buf)?;
                (buf, BTreeSet::new())
            }
        };

        let capacity = ((cache_kb as u64 * 1024) / page_size as u64).max(4) as usize;
        let page0_dirty = newly_allocated.contains(&1);

        Ok(Self {
            file,
            page_size,
            capacity,
            frames: vec![Vec::new(); capacity],
            frame_page: vec![0; capacity],
            disk_to_frame: HashMap::new(),
            prev: vec![NIL; capacity],
            next: vec![NIL; capacity],
            mru: NIL,
            lru: NIL,
            last_free: NIL,
            newly_allocated,
            file_page_count,
            page0,
            page0_dirty,
            is_changed,
            mark_changed,
            batch_size: MIN_BATCH,
            requests: 0,
            misses: 0,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn file_page_count(&self) -> u32 {
        self.file_page_count
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn page0(&self) -> &[u8] {
        &self.page0
    }

    pub fn page0_mut(&mut self) -> &mut [u8] {
        self.page0_dirty = true;
        &mut self.page0
    }

    fn unlink(&mut self, frame: usize) {
        let (p, n) = (self.prev[frame], self.next[frame]);
        if p != NIL {
            self.next[p] = n;
        } else {
            self.mru = n;
        }
        if n != NIL {
            self.prev[n] = p;
        } else {
            self.lru = p;
        }
        if self.last_free == frame {
            self.last_free = NIL;
        }
    }

    fn push_mru(&mut self, frame: usize) {
        self.prev[frame] = NIL;
        self.next[frame] = self.mru;
        if self.mru != NIL {
            self.prev[self.mru] = frame;
        }
        self.mru = frame;
        if self.lru == NIL {
            self.lru = frame;
        }
    }

    fn touch(&mut self, frame: usize) {
        if self.mru == frame {
            return;
        }
        self.unlink(frame);
        self.push_mru(frame);
    }

    /// Returns the frame index holding `page_no`, reading it from disk (or
    /// synthesizing a zero page past EOF) if it is not already resident.
    /// `keep` names a page the caller is currently working on and that must
    /// not be chosen as an eviction victim (the "block_to_keep" pin).
    pub fn get(&mut self, page_no: u32, keep: Option<u32>) -> Result<usize> {
        assert_ne!(page_no, 1, "page 1 is served from the page0 stash, not a frame");
        self.requests += 1;

        if let Some(&frame) = self.disk_to_frame.get(&page_no) {
            self.touch(frame);
            return Ok(frame);
        }

        self.misses += 1;
        let frame = self.evict_victim(keep)?;
        self.load_into_frame(frame, page_no)?;
        Ok(frame)
    }

    pub fn frame(&self, frame: usize) -> &[u8] {
        &self.frames[frame]
    }

    pub fn frame_mut(&mut self, frame: usize) -> &mut [u8] {
        &mut self.frames[frame]
    }

    fn load_into_frame(&mut self, frame: usize, page_no: u32) -> Result<()> {
        let page_size = self.page_size as usize;
        let mut buf = vec![0u8; page_size];
        if page_no <= self.file_page_count && !self.newly_allocated.contains(&page_no) {
            self.file
                .seek(SeekFrom::Start((page_no as u64 - 1) * self.page_size as u64))?;
            match self.file.read_exact(&mut buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // Past EOF: a higher-numbered root reserved before its
                    // leaves exist. Zero-filled, not an error.
                }
                Err(e) => return Err(e.into()),
            }
        }

        let old_page = self.frame_page[frame];
        if old_page != 0 {
            self.disk_to_frame.remove(&old_page);
        }
        self.frames[frame] = buf;
        self.frame_page[frame] = page_no;
        self.disk_to_frame.insert(page_no, frame);
        self.touch(frame);
        Ok(())
    }

    /// Allocates a brand-new page: bumps the file's page count, remembers it
    /// must be written to disk even though nothing has touched it yet, and
    /// hands back a zeroed frame. No disk write happens here.
    pub fn new_page(&mut self, keep: Option<u32>) -> Result<(u32, usize)> {
        self.file_page_count += 1;
        let page_no = self.file_page_count;
        self.newly_allocated.insert(page_no);

        let frame = self.evict_victim(keep)?;
        self.frames[frame] = vec![0u8; self.page_size as usize];
        if self.frame_page[frame] != 0 {
            self.disk_to_frame.remove(&self.frame_page[frame]);
        }
        self.frame_page[frame] = page_no;
        self.disk_to_frame.insert(page_no, frame);
        self.touch(frame);

        debug!("allocated page {page_no}, file now {} pages", self.file_page_count);
        Ok((page_no, frame))
    }

    /// Finds a frame to reuse, scanning from `last_free` (or the LRU tail)
    /// backward for a clean frame that isn't `keep`. Falls back to a partial
    /// flush if the whole cache is dirty or pinned.
    fn evict_victim(&mut self, keep: Option<u32>) -> Result<usize> {
        if self.disk_to_frame.len() < self.capacity {
            for frame in 0..self.capacity {
                if self.frame_page[frame] == 0 {
                    return Ok(frame);
                }
            }
        }

        let scan_limit = self.capacity;
        loop {
            let mut cursor = if self.last_free != NIL {
                self.last_free
            } else {
                self.lru
            };
            let mut scanned = 0;

            while cursor != NIL && scanned < scan_limit {
                let page_no = self.frame_page[cursor];
                let pinned = keep == Some(page_no);
                let dirty = (self.is_changed)(&self.frames[cursor], self.page_size as usize);
                if !pinned && !dirty {
                    self.last_free = self.prev[cursor];
                    return Ok(cursor);
                }
                cursor = self.prev[cursor];
                scanned += 1;
            }

            trace!(
                "eviction scan found no clean victim among {scanned} frames, flushing a batch of {}",
                self.batch_size
            );
            let flushed = self.flush_batch(keep)?;
            if flushed == 0 {
                warn!("page cache fully pinned/dirty with no progress; growing batch size");
            }
            self.tune_batch_size(flushed);
        }
    }

    fn tune_batch_size(&mut self, flushed: usize) {
        if flushed >= self.batch_size && self.batch_size < MAX_BATCH {
            self.batch_size = (self.batch_size * 2).min(MAX_BATCH);
        } else if self.requests > 0 && self.misses * 4 < self.requests && self.batch_size > MIN_BATCH {
            self.batch_size = (self.batch_size / 2).max(MIN_BATCH);
        }
    }

    /// Writes out a bounded batch of dirty frames plus all pending
    /// newly-allocated pages (ascending order, so the file never gets a
    /// hole), clearing dirty bits as it goes. Returns how many frames were
    /// cleaned.
    fn flush_batch(&mut self, keep: Option<u32>) -> Result<usize> {
        self.flush_newly_allocated()?;

        let mut cleaned = 0;
        let mut cursor = self.lru;
        while cursor != NIL && cleaned < self.batch_size {
            let page_no = self.frame_page[cursor];
            if page_no != 0 && keep != Some(page_no) {
                let dirty = (self.is_changed)(&self.frames[cursor], self.page_size as usize);
                if dirty {
                    self.write_frame(cursor)?;
                    (self.mark_changed)(&mut self.frames[cursor], self.page_size as usize, false);
                    cleaned += 1;
                }
            }
            cursor = self.prev[cursor];
        }
        Ok(cleaned)
    }

    fn flush_newly_allocated(&mut self) -> Result<()> {
        let pending: Vec<u32> = self.newly_allocated.iter().copied().collect();
        for page_no in pending {
            if let Some(&frame) = self.disk_to_frame.get(&page_no) {
                self.write_frame(frame)?;
                (self.mark_changed)(&mut self.frames[frame], self.page_size as usize, false);
            }
            self.newly_allocated.remove(&page_no);
        }
        Ok(())
    }

    fn write_frame(&mut self, frame: usize) -> Result<()> {
        let page_no = self.frame_page[frame];
        self.file
            .seek(SeekFrom::Start((page_no as u64 - 1) * self.page_size as u64))?;
        self.file.write_all(&self.frames[frame])?;
        Ok(())
    }

    /// Writes every dirty frame and the stashed page 0, in ascending page
    /// order, and clears the newly-allocated set.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_newly_allocated()?;

        let mut dirty_frames: Vec<(u32, usize)> = (0..self.capacity)
            .filter(|&f| {
                self.frame_page[f] != 0
                    && (self.is_changed)(&self.frames[f], self.page_size as usize)
            })
            .map(|f| (self.frame_page[f], f))
            .collect();
        dirty_frames.sort_unstable_by_key(|&(page_no, _)| page_no);

        for (_, frame) in dirty_frames {
            self.write_frame(frame)?;
            (self.mark_changed)(&mut self.frames[frame], self.page_size as usize, false);
        }

        if self.page0_dirty {
            self.file.seek(SeekFrom::Start(0))?;
            self.file.write_all(&self.page0)?;
            self.page0_dirty = false;
        }

        self.file.flush()?;
        debug!(
            "cache flush complete: {} pages resident, {} requests, {} misses",
            self.disk_to_frame.len(),
            self.requests,
            self.misses
        );
        Ok(())
    }

    /// Flushes and releases the file handle. Called once, from the handle's
    /// `close`.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path() -> std::path::PathBuf {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("sqlite_blast_writer_cache_test_{n}.db"))
    }

    fn is_changed(data: &[u8], page_size: usize) -> bool {
        page::is_dirty(data, page_size)
    }
    fn mark_changed(data: &mut [u8], page_size: usize, dirty: bool) {
        page::set_dirty(data, page_size, dirty)
    }

    #[test]
    fn test_new_page_then_get_round_trips() {
        let path = temp_path();
        let mut cache = PageCache::open(&path, 512, 64, is_changed, mark_changed, Some(vec![0u8; 512]))
            .unwrap();

        let (page_no, frame) = cache.new_page(None).unwrap();
        cache.frame_mut(frame)[10] = 0xAB;
        mark_changed(cache.frame_mut(frame), 512, true);
        cache.flush().unwrap();

        let frame2 = cache.get(page_no, None).unwrap();
        assert_eq!(cache.frame(frame2)[10], 0xAB);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_read_past_eof_is_zero_page() {
        let path = temp_path();
        let mut cache = PageCache::open(&path, 512, 64, is_changed, mark_changed, Some(vec![0u8; 512]))
            .unwrap();
        cache.file_page_count = 5;
        let frame = cache.get(5, None).unwrap();
        assert!(cache.frame(frame).iter().all(|&b| b == 0));
        std::fs::remove_file(&path).ok();
    }
}
