use crate::protocol::result::{QueryResult, Value};

pub(crate) const MAGIC: u32 = 0x4442_4352;
pub(crate) const VERSION: u16 = 1;
// magic(4) + version(2) + kind(1)
pub(crate) const HEADER_SIZE: usize = 7;

pub(crate) const KIND_EMPTY: u8 = 0;
pub(crate) const KIND_ROW_COUNT: u8 = 1;
pub(crate) const KIND_ROWS: u8 = 2;

pub(crate) const CELL_NULL: u8 = 0;
pub(crate) const CELL_INTEGER: u8 = 1;
pub(crate) const CELL_NUMBER: u8 = 2;
pub(crate) const CELL_STRING: u8 = 3;
pub(crate) const CELL_BINARY: u8 = 4;

/// Binary form of a `QueryResult` handed across the C ABI.
///
/// Layout (little endian): header, then for `KIND_ROW_COUNT` an `i32`; for
/// `KIND_ROWS` `col_count: u16`, `row_count: u32`, each column name as
/// `len: u16` + bytes, then every cell as a tag byte followed by its payload
/// (`i32`, `f64`, or `len: u32` + bytes).
pub struct ResultEncoder;

impl ResultEncoder {
    pub fn encode(result: &QueryResult) -> Vec<u8> {
        let mut output = Vec::with_capacity(HEADER_SIZE + Self::payload_hint(result));
        output.extend_from_slice(&MAGIC.to_le_bytes());
        output.extend_from_slice(&VERSION.to_le_bytes());

        match result {
            QueryResult::Empty => output.push(KIND_EMPTY),
            QueryResult::RowCount(n) => {
                output.push(KIND_ROW_COUNT);
                output.extend_from_slice(&n.to_le_bytes());
            }
            QueryResult::Rows(rows) => {
                output.push(KIND_ROWS);
                let columns = rows.first().map(|r| r.columns()).unwrap_or(&[]);
                output.extend_from_slice(&(columns.len() as u16).to_le_bytes());
                output.extend_from_slice(&(rows.len() as u32).to_le_bytes());
                for name in columns {
                    output.extend_from_slice(&(name.len() as u16).to_le_bytes());
                    output.extend_from_slice(name.as_bytes());
                }
                for row in rows {
                    for value in row.values() {
                        Self::encode_value(&mut output, value);
                    }
                }
            }
        }

        output
    }

    fn encode_value(output: &mut Vec<u8>, value: &Value) {
        match value {
            Value::Null => output.push(CELL_NULL),
            Value::Integer(n) => {
                output.push(CELL_INTEGER);
                output.extend_from_slice(&n.to_le_bytes());
            }
            Value::Number(n) => {
                output.push(CELL_NUMBER);
                output.extend_from_slice(&n.to_le_bytes());
            }
            Value::String(s) => {
                output.push(CELL_STRING);
                output.extend_from_slice(&(s.len() as u32).to_le_bytes());
                output.extend_from_slice(s.as_bytes());
            }
            Value::Binary(b) => {
                output.push(CELL_BINARY);
                output.extend_from_slice(&(b.len() as u32).to_le_bytes());
                output.extend_from_slice(b);
            }
        }
    }

    fn payload_hint(result: &QueryResult) -> usize {
        match result {
            QueryResult::Rows(rows) => rows.iter().map(|r| r.len() * 9).sum(),
            _ => 4,
        }
    }
}
