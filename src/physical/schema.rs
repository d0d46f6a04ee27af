//! Page 0: the 100-byte SQLite file header plus the single-row
//! `sqlite_master` leaf-table page that names this engine's one table.
//!
//! Built once when a database is created; the page-count field is patched in
//! place every time the handle closes, so the header always reflects the
//! file's true size without requiring a second builder for "update" vs.
//! "create" (the original source carried two near-identical page-0 builders
//! for its main-engine and append-only variants; this folds them into one).

use crate::error::{Error, Result};
use crate::physical::codec::{self, Value};
use crate::physical::page::{self, PageType};
use crate::physical::record;
use crate::physical::varint;

const MAGIC: &[u8; 16] = b"SQLite format 3\0";
/// Engine signature, stamped into the `application_id` header field.
const APPLICATION_ID: u32 = 0xA500_0000;
/// 3.16.0, encoded the way `SQLITE_VERSION_NUMBER` always is:
/// `major*1_000_000 + minor*1_000 + patch`.
const SQLITE_VERSION_NUMBER: u32 = 3_016_000;

/// The root page is always page 2: page 0 (the 100-byte header plus
/// `sqlite_master`) occupies page 1, and the table's root is the very next
/// page allocated.
pub const ROOT_PAGE: u32 = 2;

pub struct TableDef {
    pub table_name: String,
    pub columns: Vec<String>,
    pub pk_col_count: usize,
}

/// Builds a fresh page 0: the 100-byte file header, then an initialized
/// leaf-table page holding exactly one `sqlite_master` row describing
/// `table`.
pub fn build_page0(page_size: u32, reserved_bytes: u8, table: &TableDef) -> Result<Vec<u8>> {
    let mut data = vec![0u8; page_size as usize];
    write_file_header(&mut data, page_size, reserved_bytes, 1);

    page::init_page(&mut data, 1, PageType::LeafTable);
    write_master_row(&mut data, table, ROOT_PAGE)?;
    Ok(data)
}

/// Rewrites the 100-byte header's page-count field and validates that the
/// magic/page-size residue of a pre-existing page 0 matches what the caller
/// expects to see on open.
pub fn validate_header(data: &[u8], expected_page_size: u32) -> Result<()> {
    if &data[0..16] != MAGIC {
        return Err(Error::Malformed("file does not start with the SQLite 3 magic header".into()));
    }
    let stored = codec::read_u16(&data[16..18]);
    let actual_page_size = if stored == 1 { 65536 } else { stored as u32 };
    if actual_page_size != expected_page_size {
        return Err(Error::InvalidPageSize(actual_page_size));
    }
    Ok(())
}

/// Patches the page-count field (offset 28) to `page_count`. Called once,
/// from `Handle::close`, after every dirty frame has been accounted for.
pub fn set_page_count(data: &mut [u8], page_count: u32) {
    codec::write_u32(page_count, &mut data[28..32]);
}

fn write_file_header(data: &mut [u8], page_size: u32, reserved_bytes: u8, page_count: u32) {
    data[0..16].copy_from_slice(MAGIC);

    let stored_page_size: u16 = if page_size == 65536 { 1 } else { page_size as u16 };
    codec::write_u16(stored_page_size, &mut data[16..18]);

    data[18] = 1; // file format write version
    data[19] = 1; // file format read version
    data[20] = reserved_bytes;
    data[21] = 64; // max embedded payload fraction
    data[22] = 32; // min embedded payload fraction
    data[23] = 32; // leaf payload fraction
    // 24..28 file change counter: left at 0, nothing tracks schema edits here.

    set_page_count(data, page_count);

    // 32..40 freelist trunk page / freelist page count: this engine never
    // frees a page, so both stay 0.

    codec::write_u32(4, &mut data[44..48]); // schema format number
    codec::write_u32(1, &mut data[56..60]); // text encoding: 1 = UTF-8
    codec::write_u32(APPLICATION_ID, &mut data[68..72]);

    // 72..92 reserved for expansion, left zeroed.
    codec::write_u32(1, &mut data[92..96]); // version-valid-for placeholder
    codec::write_u32(SQLITE_VERSION_NUMBER, &mut data[96..100]);
}

/// Synthesizes the `CREATE TABLE ... WITHOUT ROWID` text stored in
/// `sqlite_master.sql`, with a `PRIMARY KEY` clause over the leading
/// `pk_col_count` columns.
fn create_table_sql(table: &TableDef) -> String {
    let cols = table.columns.join(", ");
    let pk_cols = table.columns[..table.pk_col_count].join(", ");
    format!(
        "CREATE TABLE \"{}\" ({}, PRIMARY KEY ({})) WITHOUT ROWID",
        table.table_name, cols, pk_cols
    )
}

/// Writes the single `sqlite_master` row (rowid 1) into the already
/// `init_page`-initialized leaf-table page at page 1. The row never spills
/// to an overflow chain — the spec defines the leaf-table cell layout
/// without an overflow pointer, relying on `CREATE TABLE` text for one table
/// always fitting comfortably within a page.
fn write_master_row(data: &mut [u8], table: &TableDef, root_page: u32) -> Result<()> {
    let sql = create_table_sql(table);
    let values = [
        Value::Text(b"table"),
        Value::Text(table.table_name.as_bytes()),
        Value::Text(table.table_name.as_bytes()),
        Value::Int(root_page as i64),
        Value::Text(sql.as_bytes()),
    ];
    let payload = record::build(&values);

    let rowid = 1u64;
    let cell_len = varint::vlen(payload.len() as u64) + varint::vlen(rowid) + payload.len();

    let page_type = PageType::LeafTable;
    let max = data.len() - page::RESERVED_BYTES - page::header_offset(1) - page_type.header_size() - 2;
    if cell_len > max {
        return Err(Error::TooLong { len: cell_len, max });
    }

    let offset = page::allocate_cell_space(data, 1, cell_len)?;
    let mut scratch = [0u8; 9];
    let mut w = offset;
    let n = varint::write(payload.len() as u64, &mut scratch);
    data[w..w + n].copy_from_slice(&scratch[..n]);
    w += n;
    let n = varint::write(rowid, &mut scratch);
    data[w..w + n].copy_from_slice(&scratch[..n]);
    w += n;
    data[w..w + payload.len()].copy_from_slice(&payload);

    page::insert_cell_pointer(data, 1, page_type, 0, offset as u16)?;
    Ok(())
}

/// The one row stored in `sqlite_master`, decoded back out of page 0.
pub struct MasterRow {
    pub table_name: String,
    pub root_page: u32,
}

/// Reads the single `sqlite_master` cell out of an already-loaded page 0,
/// used when opening an existing database to recover its root page.
pub fn read_master(data: &[u8]) -> Result<MasterRow> {
    let page_type: PageType = data[page::header_offset(1)].try_into()?;
    if page_type != PageType::LeafTable {
        return Err(Error::Malformed("page 1 is not a leaf-table page".into()));
    }
    let count = page::cell_count(data, 1)?;
    if count != 1 {
        return Err(Error::Malformed(format!(
            "sqlite_master expected exactly one row, found {count}"
        )));
    }

    let offset = page::cell_pointer(data, 1, PageType::LeafTable, 0) as usize;
    let cell = &data[offset..];
    let (payload_len, n1) = varint::read(cell);
    let (_rowid, n2) = varint::read(&cell[n1..]);
    let payload = &cell[n1 + n2..n1 + n2 + payload_len as usize];

    let record = record::Record::new(payload)?;
    let table_name = match record.column(1)? {
        Value::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        other => return Err(Error::Malformed(format!("sqlite_master.name has type {other:?}"))),
    };
    let root_page = match record.column(3)? {
        Value::Int(v) => v as u32,
        other => return Err(Error::Malformed(format!("sqlite_master.rootpage has type {other:?}"))),
    };

    Ok(MasterRow { table_name, root_page })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> TableDef {
        TableDef {
            table_name: "surnames".to_string(),
            columns: vec!["name".to_string(), "year".to_string(), "rank".to_string()],
            pk_col_count: 2,
        }
    }

    #[test]
    fn test_build_page0_header_fields() {
        let data = build_page0(4096, 1, &sample_table()).unwrap();
        assert_eq!(&data[0..16], MAGIC);
        assert_eq!(codec::read_u16(&data[16..18]), 4096);
        assert_eq!(data[20], 1);
        assert_eq!(codec::read_u32(&data[28..32]), 1);
        assert_eq!(codec::read_u32(&data[44..48]), 4);
        assert_eq!(codec::read_u32(&data[56..60]), 1);
        assert_eq!(codec::read_u32(&data[68..72]), APPLICATION_ID);
    }

    #[test]
    fn test_build_page0_65536_page_size_encodes_as_one() {
        let data = build_page0(65536, 0, &sample_table()).unwrap();
        assert_eq!(codec::read_u16(&data[16..18]), 1);
    }

    #[test]
    fn test_master_row_roundtrip() {
        let table = sample_table();
        let data = build_page0(4096, 1, &table).unwrap();
        let master = read_master(&data).unwrap();
        assert_eq!(master.table_name, "surnames");
        assert_eq!(master.root_page, ROOT_PAGE);
    }

    #[test]
    fn test_validate_header_rejects_wrong_page_size() {
        let data = build_page0(4096, 1, &sample_table()).unwrap();
        assert!(validate_header(&data, 4096).is_ok());
        assert!(matches!(
            validate_header(&data, 512),
            Err(Error::InvalidPageSize(4096))
        ));
    }

    #[test]
    fn test_validate_header_rejects_bad_magic() {
        let mut data = build_page0(4096, 1, &sample_table()).unwrap();
        data[0] = 0;
        assert!(matches!(validate_header(&data, 4096), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_set_page_count_patches_offset_28() {
        let mut data = build_page0(4096, 1, &sample_table()).unwrap();
        set_page_count(&mut data, 77);
        assert_eq!(codec::read_u32(&data[28..32]), 77);
    }
}
