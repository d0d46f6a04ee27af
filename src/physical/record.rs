//! Record framing: packs column values into the SQLite payload layout
//! (`varint(header_len) ‖ type codes ‖ column data`) and decodes that layout
//! back into typed columns. Also the two key-comparison modes the B-tree
//! needs while it walks a page.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::physical::codec::Value;
use crate::physical::varint;

/// Packs `values` into a contiguous record buffer.
///
/// The header length field is self-referential (its own varint width counts
/// toward the length it encodes), so it is solved by fixed-point iteration,
/// the same trick `sqlite_index_blaster.cpp`'s record writer uses.
pub fn build(values: &[Value]) -> Vec<u8> {
    let codes: Vec<u64> = values.iter().map(|v| v.serial_type().0).collect();
    let header_body_len: usize = codes.iter().map(|&c| varint::vlen(c)).sum();

    let mut header_len = header_body_len + 1;
    loop {
        let needed = varint::vlen(header_len as u64) + header_body_len;
        if needed == header_len {
            break;
        }
        header_len = needed;
    }

    let content_len: usize = values.iter().map(|v| v.serial_type().1).sum();
    let mut buf = Vec::with_capacity(header_len + content_len);

    let mut scratch = [0u8; 9];
    let n = varint::write(header_len as u64, &mut scratch);
    buf.extend_from_slice(&scratch[..n]);

    for &code in &codes {
        let n = varint::write(code, &mut scratch);
        buf.extend_from_slice(&scratch[..n]);
    }

    for value in values {
        let (_, len) = value.serial_type();
        let start = buf.len();
        buf.resize(start + len, 0);
        value.write_content(&mut buf[start..]);
    }

    buf
}

/// A decoded view over a packed record's bytes. Does not copy; column
/// accesses borrow from the record's own buffer.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    bytes: &'a [u8],
    header_len: usize,
}

impl<'a> Record<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::Malformed("empty record".into()));
        }
        let (header_len, _) = varint::read(bytes);
        let header_len = header_len as usize;
        if header_len == 0 || header_len > bytes.len() {
            return Err(Error::Malformed(format!(
                "record header length {header_len} exceeds record size {}",
                bytes.len()
            )));
        }
        Ok(Self { bytes, header_len })
    }

    /// Iterates the serial-type codes in the record's header, in column order.
    pub fn type_codes(&self) -> HeaderIter<'a> {
        let (_, n) = varint::read(self.bytes);
        HeaderIter {
            remaining: &self.bytes[n..self.header_len],
        }
    }

    /// Decodes every column in order.
    pub fn columns(&self) -> Result<ColumnIter<'a>> {
        Ok(ColumnIter {
            codes: self.type_codes(),
            content: &self.bytes[self.header_len..],
        })
    }

    /// Decodes a single column by index. O(n) in the column index, same as
    /// the header must be walked from the start either way.
    pub fn column(&self, index: usize) -> Result<Value<'a>> {
        self.columns()?
            .nth(index)
            .transpose()?
            .ok_or_else(|| Error::Malformed(format!("record has no column {index}")))
    }
}

pub struct HeaderIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for HeaderIter<'a> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.remaining.is_empty() {
            return None;
        }
        let (code, n) = varint::read(self.remaining);
        self.remaining = &self.remaining[n..];
        Some(code)
    }
}

pub struct ColumnIter<'a> {
    codes: HeaderIter<'a>,
    content: &'a [u8],
}

impl<'a> Iterator for ColumnIter<'a> {
    type Item = Result<Value<'a>>;

    fn next(&mut self) -> Option<Result<Value<'a>>> {
        let code = self.codes.next()?;
        let len = match crate::physical::codec::content_len(code) {
            Ok(len) => len,
            Err(e) => return Some(Err(e)),
        };
        if len > self.content.len() {
            return Some(Err(Error::Malformed(
                "record content shorter than its header declares".into(),
            )));
        }
        let (value_bytes, rest) = self.content.split_at(len);
        self.content = rest;
        Some(Value::decode(code, value_bytes))
    }
}

/// SQLite's type-aware scalar ordering: `NULL < numbers < text < blob`; among
/// numbers, `Int` and `Real` compare by numeric value; text and blob compare
/// byte-wise with a shorter, matching prefix sorting less.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Int(_) | Value::Real(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }

    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Real(x), Value::Real(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Int(x), Value::Real(y)) => (*x as f64).partial_cmp(y).unwrap_or(Ordering::Equal),
        (Value::Real(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)).unwrap_or(Ordering::Equal),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        _ => unreachable!("rank() partitions values so mismatched kinds never reach here"),
    }
}

/// Full-record vs full-record comparison over the leading `pk_col_count`
/// columns, used when both sides are stored records (e.g. comparing a
/// to-be-inserted key against a cell already on a page).
pub fn compare_records(a: &Record, b: &Record, pk_col_count: usize) -> Result<Ordering> {
    for i in 0..pk_col_count {
        let ca = a.column(i)?;
        let cb = b.column(i)?;
        let ord = compare_values(&ca, &cb);
        if ord != Ordering::Equal {
            return Ok(ord);
        }
    }
    Ok(Ordering::Equal)
}

/// Full-record vs raw prefix-key comparison: compares `key` only against the
/// text/blob bytes of the record's first column. This is the shortcut path
/// for callers who key a table by a single text or blob column and pass the
/// raw bytes rather than a packed single-column record.
pub fn compare_key_to_first_column(key: &[u8], record: &Record) -> Result<Ordering> {
    match record.column(0)? {
        Value::Text(bytes) | Value::Blob(bytes) => Ok(key.cmp(bytes)),
        other => Err(Error::TypeMismatch(format!(
            "prefix-key comparison requires a text/blob first column, found {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_decode_roundtrip() {
        let values = vec![
            Value::Int(42),
            Value::Text(b"hello"),
            Value::Null,
            Value::Real(3.5),
            Value::Blob(b"\x00\x01\x02"),
        ];
        let bytes = build(&values);
        let record = Record::new(&bytes).unwrap();
        let decoded: Vec<Value> = record.columns().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_build_widens_f32_real_column() {
        let values = vec![Value::Text(b"pi"), Value::from_f32(3.14159_f32)];
        let bytes = build(&values);
        let record = Record::new(&bytes).unwrap();
        match record.column(1).unwrap() {
            Value::Real(v) => assert_eq!(v as f32, 3.14159_f32),
            other => panic!("expected Real, got {other:?}"),
        }
    }

    #[test]
    fn test_build_single_zero_column() {
        let values = vec![Value::Int(0)];
        let bytes = build(&values);
        let record = Record::new(&bytes).unwrap();
        assert_eq!(record.column(0).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_compare_values_ordering() {
        assert_eq!(compare_values(&Value::Null, &Value::Int(0)), Ordering::Less);
        assert_eq!(
            compare_values(&Value::Int(5), &Value::Text(b"a")),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::Text(b"a"), &Value::Blob(b"a")),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::Int(3), &Value::Real(3.0)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_compare_text_prefix_tie_break() {
        assert_eq!(
            compare_values(&Value::Text(b"abc"), &Value::Text(b"abcd")),
            Ordering::Less
        );
    }

    #[test]
    fn test_compare_records_multi_column_pk() {
        let a = build(&[Value::Text(b"smith"), Value::Int(1990)]);
        let b = build(&[Value::Text(b"smith"), Value::Int(1991)]);
        let ra = Record::new(&a).unwrap();
        let rb = Record::new(&b).unwrap();
        assert_eq!(compare_records(&ra, &rb, 2).unwrap(), Ordering::Less);
        assert_eq!(compare_records(&ra, &rb, 1).unwrap(), Ordering::Equal);
    }
}
