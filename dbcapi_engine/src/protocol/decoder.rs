use crate::error::{DbError, Result};
use crate::protocol::encoder::{
    CELL_BINARY, CELL_INTEGER, CELL_NULL, CELL_NUMBER, CELL_STRING, HEADER_SIZE, KIND_EMPTY,
    KIND_ROWS, KIND_ROW_COUNT, MAGIC, VERSION,
};
use crate::protocol::result::{QueryResult, Row, Value};
use std::sync::Arc;

struct Cursor<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.offset.checked_add(n).ok_or(DbError::ResultSetError)?;
        let slice = self
            .buffer
            .get(self.offset..end)
            .ok_or(DbError::ResultSetError)?;
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.take(N)?
            .try_into()
            .map_err(|_| DbError::ResultSetError)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }
}

/// Parses the output of `ResultEncoder::encode`.
pub struct ResultDecoder;

impl ResultDecoder {
    pub fn parse(buffer: &[u8]) -> Result<QueryResult> {
        if buffer.len() < HEADER_SIZE {
            log::debug!(
                "result buffer too small: need at least {} bytes, got {}",
                HEADER_SIZE,
                buffer.len()
            );
            return Err(DbError::ResultSetError);
        }

        let mut cur = Cursor { buffer, offset: 0 };
        let magic = cur.u32()?;
        let version = cur.u16()?;
        if magic != MAGIC || version != VERSION {
            log::debug!(
                "unexpected result header: magic 0x{:08X}, version {}",
                magic,
                version
            );
            return Err(DbError::ResultSetError);
        }

        let result = match cur.u8()? {
            KIND_EMPTY => QueryResult::Empty,
            KIND_ROW_COUNT => QueryResult::RowCount(i32::from_le_bytes(cur.array()?)),
            KIND_ROWS => Self::parse_rows(&mut cur)?,
            _ => return Err(DbError::ResultSetError),
        };

        if cur.offset != buffer.len() {
            return Err(DbError::ResultSetError);
        }
        Ok(result)
    }

    fn parse_rows(cur: &mut Cursor<'_>) -> Result<QueryResult> {
        let col_count = cur.u16()? as usize;
        let row_count = cur.u32()? as usize;

        let mut names = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            let len = cur.u16()? as usize;
            let name = std::str::from_utf8(cur.take(len)?).map_err(|_| DbError::ResultSetError)?;
            names.push(name.to_string());
        }
        let columns: Arc<[String]> = names.into();

        let mut rows = Vec::with_capacity(row_count);
        for _ in 0..row_count {
            let mut values = Vec::with_capacity(col_count);
            for _ in 0..col_count {
                let value = match cur.u8()? {
                    CELL_NULL => Value::Null,
                    CELL_INTEGER => Value::Integer(i32::from_le_bytes(cur.array()?)),
                    CELL_NUMBER => Value::Number(f64::from_le_bytes(cur.array()?)),
                    CELL_STRING => {
                        let len = cur.u32()? as usize;
                        Value::String(String::from_utf8_lossy(cur.take(len)?).into_owned())
                    }
                    CELL_BINARY => {
                        let len = cur.u32()? as usize;
                        Value::Binary(cur.take(len)?.to_vec())
                    }
                    _ => return Err(DbError::ResultSetError),
                };
                values.push(value);
            }
            rows.push(Row::new(columns.clone(), values));
        }
        Ok(QueryResult::Rows(rows))
    }
}
