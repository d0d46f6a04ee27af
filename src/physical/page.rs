//! B-tree page layout: header fields, the cell-pointer array, and the
//! cell-content heap. Pure slice operations — no I/O, no cache awareness.
//!
//! Page 1 additionally carries a 100-byte file-header prefix ahead of its
//! b-tree page header; every accessor here takes the page number so it can
//! add that offset when needed.

use zerocopy::{
    big_endian::{U16, U32},
    AsBytes, FromBytes,
};

use crate::error::{Error, Result};

/// Page-1-only file header prefix length, ahead of the b-tree page header.
pub const FILE_HEADER_LEN: usize = 100;

/// Reserved trailing bytes per page, carved out of `page_size` for the dirty
/// bit. Kept at 1: the engine needs only a single bit and SQLite's own
/// `reserved_bytes` field already exists for exactly this kind of
/// engine-private trailer.
pub const RESERVED_BYTES: usize = 1;

/// Bit within the single reserved trailing byte that marks a page dirty.
const DIRTY_BIT: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    InteriorIndex,
    LeafIndex,
    /// Used only for the single-row `sqlite_master` page (page 1).
    LeafTable,
}

impl PageType {
    pub fn is_leaf(self) -> bool {
        matches!(self, PageType::LeafIndex | PageType::LeafTable)
    }

    /// Header size in bytes: 8 for leaf pages, 12 for interior pages (the
    /// extra 4 bytes hold the right-most child pointer).
    pub fn header_size(self) -> usize {
        if self.is_leaf() {
            8
        } else {
            12
        }
    }
}

impl TryFrom<u8> for PageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x02 => Ok(PageType::InteriorIndex),
            0x0a => Ok(PageType::LeafIndex),
            0x0d => Ok(PageType::LeafTable),
            other => Err(Error::Malformed(format!("invalid b-tree page type {other:#x}"))),
        }
    }
}

impl From<PageType> for u8 {
    fn from(value: PageType) -> u8 {
        match value {
            PageType::InteriorIndex => 0x02,
            PageType::LeafIndex => 0x0a,
            PageType::LeafTable => 0x0d,
        }
    }
}

/// The 8-byte header common to every b-tree page. Interior pages have 4
/// further bytes immediately after (the right-most child pointer), read and
/// written separately since this struct must stay `Unaligned`-sized for both
/// kinds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    zerocopy::FromZeroes,
    zerocopy::FromBytes,
    zerocopy::AsBytes,
    zerocopy::Unaligned,
)]
#[repr(C)]
pub struct PageHeader {
    pub page_type: u8,
    pub first_freeblock: U16,
    pub cell_count: U16,
    /// Low-water mark of the cell-content heap; 0 encodes 65536.
    pub cell_content_start: U16,
    pub fragmented_free_bytes: u8,
}

/// Offset of the b-tree page header within the page's raw bytes.
pub fn header_offset(page_number: u32) -> usize {
    if page_number == 1 {
        FILE_HEADER_LEN
    } else {
        0
    }
}

fn read_header(data: &[u8], page_number: u32) -> Result<PageHeader> {
    let start = header_offset(page_number);
    PageHeader::read_from_prefix(&data[start..])
        .ok_or_else(|| Error::Malformed("page too short for a b-tree header".into()))
}

fn write_header(data: &mut [u8], page_number: u32, header: &PageHeader) {
    let start = header_offset(page_number);
    header
        .write_to_prefix(&mut data[start..])
        .expect("header buffer is always large enough");
}

pub fn page_type(data: &[u8], page_number: u32) -> Result<PageType> {
    read_header(data, page_number)?.page_type.try_into()
}

pub fn cell_count(data: &[u8], page_number: u32) -> Result<u16> {
    Ok(read_header(data, page_number)?.cell_count.get())
}

fn cell_content_start(header: &PageHeader) -> u16 {
    // A stored value of 0 encodes 65536, which never fits in a u16; callers
    // that need the numeric value for arithmetic should go through
    // `cell_content_heap_start` instead, which widens to usize.
    header.cell_content_start.get()
}

pub fn cell_content_heap_start(data: &[u8], page_number: u32) -> Result<usize> {
    let raw = cell_content_start(&read_header(data, page_number)?);
    Ok(if raw == 0 { 65536 } else { raw as usize })
}

pub fn right_most_pointer(data: &[u8], page_number: u32) -> Result<u32> {
    let start = header_offset(page_number) + 8;
    Ok(U32::read_from_prefix(&data[start..])
        .ok_or_else(|| Error::Malformed("interior page too short for right-most pointer".into()))?
        .get())
}

pub fn set_right_most_pointer(data: &mut [u8], page_number: u32, child: u32) {
    let start = header_offset(page_number) + 8;
    U32::from(child)
        .write_to_prefix(&mut data[start..])
        .expect("interior page header reserves 4 bytes for this");
}

/// Initializes an empty page of the given type: header fields for zero cells,
/// an empty heap (content start at the page end), and — for interior pages —
/// the right-most pointer.
pub fn init_page(data: &mut [u8], page_number: u32, page_type: PageType) {
    // The heap never encroaches on the trailing reserved byte the dirty bit
    // lives in.
    let usable_end = data.len() - RESERVED_BYTES;
    let header = PageHeader {
        page_type: page_type.into(),
        first_freeblock: 0.into(),
        cell_count: 0.into(),
        cell_content_start: (if usable_end == 65536 { 0 } else { usable_end as u16 }).into(),
        fragmented_free_bytes: 0,
    };
    write_header(data, page_number, &header);
    if !page_type.is_leaf() {
        set_right_most_pointer(data, page_number, 0);
    }
}

fn cell_pointer_array_offset(page_number: u32, page_type: PageType) -> usize {
    header_offset(page_number) + page_type.header_size()
}

pub fn cell_pointer(data: &[u8], page_number: u32, page_type: PageType, index: u16) -> u16 {
    let start = cell_pointer_array_offset(page_number, page_type) + index as usize * 2;
    U16::read_from_prefix(&data[start..])
        .expect("index is bounds-checked by callers against cell_count")
        .get()
}

pub fn set_cell_pointer(
    data: &mut [u8],
    page_number: u32,
    page_type: PageType,
    index: u16,
    offset: u16,
) {
    let start = cell_pointer_array_offset(page_number, page_type) + index as usize * 2;
    U16::from(offset)
        .write_to_prefix(&mut data[start..])
        .expect("index is bounds-checked by callers against cell_count");
}

/// Inserts a pointer at `index`, shifting later pointers up by one slot, and
/// bumps the cell count. Does not touch the heap; callers write the cell
/// bytes at `offset` separately via [`allocate_cell_space`].
pub fn insert_cell_pointer(
    data: &mut [u8],
    page_number: u32,
    page_type: PageType,
    index: u16,
    offset: u16,
) -> Result<()> {
    let mut header = read_header(data, page_number)?;
    let count = header.cell_count.get();

    for i in (index..count).rev() {
        let p = cell_pointer(data, page_number, page_type, i);
        set_cell_pointer(data, page_number, page_type, i + 1, p);
    }
    set_cell_pointer(data, page_number, page_type, index, offset);

    header.cell_count = (count + 1).into();
    write_header(data, page_number, &header);
    Ok(())
}

/// Removes the pointer at `index`, shifting later pointers down by one slot.
/// Does not reclaim the heap bytes the removed cell occupied (this engine
/// never defragments a page; deletion is test/utility scope only).
pub fn remove_cell_pointer(
    data: &mut [u8],
    page_number: u32,
    page_type: PageType,
    index: u16,
) -> Result<()> {
    let mut header = read_header(data, page_number)?;
    let count = header.cell_count.get();

    for i in index..count - 1 {
        let p = cell_pointer(data, page_number, page_type, i + 1);
        set_cell_pointer(data, page_number, page_type, i, p);
    }

    header.cell_count = (count - 1).into();
    write_header(data, page_number, &header);
    Ok(())
}

/// Carves `size` bytes off the low end of the cell-content heap and returns
/// the offset the caller should write the new cell at. Does not check that
/// the space does not collide with the cell-pointer array — callers (the
/// B-tree's free-space accounting) are responsible for splitting before this
/// would happen.
pub fn allocate_cell_space(data: &mut [u8], page_number: u32, size: usize) -> Result<usize> {
    let mut header = read_header(data, page_number)?;
    let current = cell_content_start(&header);
    let current = if current == 0 { 65536 } else { current as usize };
    let new_start = current - size;
    header.cell_content_start = (if new_start == 65536 { 0 } else { new_start as u16 }).into();
    write_header(data, page_number, &header);
    Ok(new_start)
}

/// Free bytes remaining between the end of the cell-pointer array and the
/// start of the cell-content heap — the page's spare capacity for a new cell
/// plus its pointer-array slot.
pub fn free_space(data: &[u8], page_number: u32, page_type: PageType) -> Result<usize> {
    let header = read_header(data, page_number)?;
    let count = header.cell_count.get() as usize;
    let heap_start = cell_content_heap_start(data, page_number)?;
    let pointer_array_end = cell_pointer_array_offset(page_number, page_type) + count * 2;
    Ok(heap_start.saturating_sub(pointer_array_end))
}

/// Reads the dirty bit the B-tree stores in the page's single reserved
/// trailing byte.
pub fn is_dirty(data: &[u8], page_size: usize) -> bool {
    data[page_size - RESERVED_BYTES] & DIRTY_BIT != 0
}

/// Sets or clears the dirty bit in the page's reserved trailing byte.
pub fn set_dirty(data: &mut [u8], page_size: usize, dirty: bool) {
    let byte = &mut data[page_size - RESERVED_BYTES];
    if dirty {
        *byte |= DIRTY_BIT;
    } else {
        *byte &= !DIRTY_BIT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_and_read_leaf_header() {
        let mut data = vec![0u8; 4096];
        init_page(&mut data, 2, PageType::LeafIndex);
        assert_eq!(page_type(&data, 2).unwrap(), PageType::LeafIndex);
        assert_eq!(cell_count(&data, 2).unwrap(), 0);
        assert_eq!(cell_content_heap_start(&data, 2).unwrap(), 4096 - RESERVED_BYTES);
    }

    #[test]
    fn test_init_interior_right_most_pointer_roundtrip() {
        let mut data = vec![0u8; 4096];
        init_page(&mut data, 3, PageType::InteriorIndex);
        set_right_most_pointer(&mut data, 3, 77);
        assert_eq!(right_most_pointer(&data, 3).unwrap(), 77);
    }

    #[test]
    fn test_page_one_header_offset_accounts_for_file_header() {
        let mut data = vec![0u8; 4096];
        init_page(&mut data, 1, PageType::LeafTable);
        assert_eq!(header_offset(1), FILE_HEADER_LEN);
        assert_eq!(page_type(&data, 1).unwrap(), PageType::LeafTable);
    }

    #[test]
    fn test_cell_pointer_insert_and_remove() {
        let mut data = vec![0u8; 4096];
        init_page(&mut data, 2, PageType::LeafIndex);
        insert_cell_pointer(&mut data, 2, PageType::LeafIndex, 0, 4000).unwrap();
        insert_cell_pointer(&mut data, 2, PageType::LeafIndex, 1, 3900).unwrap();
        insert_cell_pointer(&mut data, 2, PageType::LeafIndex, 1, 3950).unwrap();

        assert_eq!(cell_pointer(&data, 2, PageType::LeafIndex, 0), 4000);
        assert_eq!(cell_pointer(&data, 2, PageType::LeafIndex, 1), 3950);
        assert_eq!(cell_pointer(&data, 2, PageType::LeafIndex, 2), 3900);

        remove_cell_pointer(&mut data, 2, PageType::LeafIndex, 1).unwrap();
        assert_eq!(cell_count(&data, 2).unwrap(), 2);
        assert_eq!(cell_pointer(&data, 2, PageType::LeafIndex, 1), 3900);
    }

    #[test]
    fn test_dirty_bit() {
        let page_size = 512;
        let mut data = vec![0u8; page_size];
        assert!(!is_dirty(&data, page_size));
        set_dirty(&mut data, page_size, true);
        assert!(is_dirty(&data, page_size));
        set_dirty(&mut data, page_size, false);
        assert!(!is_dirty(&data, page_size));
    }
}
