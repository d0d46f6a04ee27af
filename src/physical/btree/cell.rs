//! Cell encoding for index b-tree pages (leaf-index and interior-index), and
//! the overflow-chain spill algorithm that keeps a single oversized payload
//! off the page.
//!
//! Layouts (SQLite file format):
//! - leaf-index cell:      `varint(payload_len) ‖ payload ‖ [overflow_page:4]`
//! - interior-index cell:  `child_page:4 ‖ varint(payload_len) ‖ payload ‖ [overflow_page:4]`

use crate::error::Result;
use crate::physical::cache::PageCache;
use crate::physical::codec::{read_u32, write_u32};
use crate::physical::varint;

/// Largest payload, in bytes, that fits entirely on a page of usable size
/// `u` (`u = page_size - reserved_bytes`).
pub fn max_on_page(u: usize) -> usize {
    ((u - 12) * 64 / 255) - 23
}

/// The split point SQLite's own overflow algorithm uses when a payload of
/// length `u` doesn't fit the `max_on_page` budget.
fn min_local(u: usize) -> usize {
    ((u - 12) * 32 / 255) - 23
}

/// How many of `payload_len` bytes live on the cell's own page, and whether
/// the remainder spills to an overflow chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillPlan {
    pub on_page_len: usize,
    pub overflows: bool,
}

pub fn plan_spill(payload_len: usize, u: usize) -> SpillPlan {
    let x = max_on_page(u);
    if payload_len <= x {
        return SpillPlan {
            on_page_len: payload_len,
            overflows: false,
        };
    }
    let m = min_local(u);
    let k = m + (payload_len - m) % (u - 4);
    let on_page_len = if k <= x { k } else { m };
    SpillPlan {
        on_page_len,
        overflows: true,
    }
}

/// Total bytes a cell occupies on its own page (excluding the pointer-array
/// slot), given the on-page payload slice length.
pub fn leaf_cell_len(on_page_len: usize, overflows: bool) -> usize {
    varint::vlen(on_page_len as u64) + on_page_len + if overflows { 4 } else { 0 }
}

pub fn interior_cell_len(on_page_len: usize, overflows: bool) -> usize {
    4 + leaf_cell_len(on_page_len, overflows)
}

/// Writes a leaf-index cell's bytes (not including the pointer-array entry)
/// into `out`, which must be exactly `leaf_cell_len(plan.on_page_len,
/// plan.overflows)` bytes. `first_overflow` is the already-allocated first
/// overflow page number, required iff `plan.overflows`.
pub fn write_leaf_cell(out: &mut [u8], payload: &[u8], plan: SpillPlan, first_overflow: u32) {
    let mut scratch = [0u8; 9];
    let n = varint::write(plan.on_page_len as u64, &mut scratch);
    out[..n].copy_from_slice(&scratch[..n]);
    out[n..n + plan.on_page_len].copy_from_slice(&payload[..plan.on_page_len]);
    if plan.overflows {
        write_u32(first_overflow, &mut out[n + plan.on_page_len..]);
    }
}

pub fn write_interior_cell(
    out: &mut [u8],
    child: u32,
    payload: &[u8],
    plan: SpillPlan,
    first_overflow: u32,
) {
    write_u32(child, out);
    write_leaf_cell(&mut out[4..], payload, plan, first_overflow);
}

/// Decoded view of a leaf-index cell: the on-page payload slice and, if the
/// payload spilled, the first overflow page number plus the full payload
/// length.
pub struct DecodedCell<'a> {
    pub on_page_payload: &'a [u8],
    pub full_len: usize,
    pub first_overflow: Option<u32>,
}

/// Decodes a leaf-index cell starting at `cell[0]`. `u` (the page's usable
/// size) is required because whether the payload spilled, and exactly how
/// much of it stayed on-page, is a deterministic function of `payload_len`
/// and `u` — the same computation `plan_spill` used at write time — not
/// something recoverable from the slice bounds alone.
pub fn read_leaf_cell(cell: &[u8], u: usize) -> DecodedCell<'_> {
    let (payload_len, n) = varint::read(cell);
    let payload_len = payload_len as usize;
    let plan = plan_spill(payload_len, u);
    let on_page_payload = &cell[n..n + plan.on_page_len];
    let first_overflow = if plan.overflows {
        Some(read_u32(&cell[n + plan.on_page_len..]))
    } else {
        None
    };
    DecodedCell {
        on_page_payload,
        full_len: payload_len,
        first_overflow,
    }
}

pub fn read_interior_cell(cell: &[u8], u: usize) -> (u32, DecodedCell<'_>) {
    let child = read_u32(cell);
    (child, read_leaf_cell(&cell[4..], u))
}

/// Assembles the full payload for a cell whose tail spilled to overflow
/// pages, by reading the on-page prefix plus following the chain.
pub fn read_full_payload(
    cache: &mut PageCache,
    on_page: &[u8],
    full_len: usize,
    first_overflow: Option<u32>,
) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(full_len);
    out.extend_from_slice(on_page);

    let mut next = first_overflow;
    let page_size = cache.page_size() as usize;
    let chunk = page_size - crate::physical::page::RESERVED_BYTES - 4;
    while let Some(page_no) = next {
        if out.len() >= full_len {
            break;
        }
        let frame = cache.get(page_no, None)?;
        let data = cache.frame(frame);
        let link = read_u32(data);
        let body_len = (full_len - out.len()).min(chunk);
        out.extend_from_slice(&data[4..4 + body_len]);
        next = if link == 0 { None } else { Some(link) };
    }

    Ok(out)
}

/// Writes `tail` (the portion of a payload past the on-page budget) across a
/// freshly allocated chain of overflow pages, returning the first page's
/// number. Each page holds up to `usable_size - 4` bytes after its 4-byte
/// next-pointer (`usable_size = page_size - reserved_bytes`, leaving the
/// page's reserved trailing byte untouched); the final page's next-pointer
/// is 0.
pub fn write_overflow_chain(cache: &mut PageCache, tail: &[u8], keep: Option<u32>) -> Result<u32> {
    let page_size = cache.page_size() as usize;
    let chunk = page_size - crate::physical::page::RESERVED_BYTES - 4;

    let chunks: Vec<&[u8]> = tail.chunks(chunk).collect();
    let mut pages = Vec::with_capacity(chunks.len());
    for _ in &chunks {
        let (page_no, _) = cache.new_page(keep)?;
        pages.push(page_no);
    }

    for (i, piece) in chunks.iter().enumerate() {
        let frame = cache.get(pages[i], keep)?;
        let data = cache.frame_mut(frame);
        let next = pages.get(i + 1).copied().unwrap_or(0);
        write_u32(next, data);
        data[4..4 + piece.len()].copy_from_slice(piece);
        crate::physical::page::set_dirty(data, page_size, true);
    }

    Ok(pages[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_spill_small_payload_stays_on_page() {
        let u = 4096 - 1;
        let plan = plan_spill(50, u);
        assert_eq!(plan.on_page_len, 50);
        assert!(!plan.overflows);
    }

    #[test]
    fn test_plan_spill_large_payload_overflows() {
        let u = 512 - 1;
        let x = max_on_page(u);
        let plan = plan_spill(x + 1, u);
        assert!(plan.overflows);
        assert!(plan.on_page_len <= x);
    }

    #[test]
    fn test_leaf_cell_roundtrip_no_overflow() {
        let payload = b"hello world";
        let plan = plan_spill(payload.len(), 4095);
        let len = leaf_cell_len(plan.on_page_len, plan.overflows);
        let mut buf = vec![0u8; len];
        write_leaf_cell(&mut buf, payload, plan, 0);

        let decoded = read_leaf_cell(&buf, 4095);
        assert_eq!(decoded.on_page_payload, payload);
        assert_eq!(decoded.full_len, payload.len());
        assert!(decoded.first_overflow.is_none());
    }

    #[test]
    fn test_leaf_cell_roundtrip_with_overflow() {
        let u = 512 - 1;
        let payload_len = max_on_page(u) + 100;
        let plan = plan_spill(payload_len, u);
        assert!(plan.overflows);
        let len = leaf_cell_len(plan.on_page_len, plan.overflows);
        let mut buf = vec![0u8; len];
        let payload = vec![0xAB; payload_len];
        write_leaf_cell(&mut buf, &payload, plan, 42);

        let decoded = read_leaf_cell(&buf, u);
        assert_eq!(decoded.on_page_payload.len(), plan.on_page_len);
        assert_eq!(decoded.full_len, payload_len);
        assert_eq!(decoded.first_overflow, Some(42));
    }
}
