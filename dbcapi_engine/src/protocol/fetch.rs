use crate::error::{DbError, Result};
use crate::native::{ColumnValue, ConnHandle, NativeClient, StmtHandle};
use crate::protocol::result::{QueryResult, Row, Value};
use crate::protocol::types::{DataType, TypeClass};
use std::sync::Arc;

/// Result of one native execute, collected on the worker side.
///
/// Values are grouped by type class in fetch order; `cell_types` records
/// the wire type of every cell so rows can be rebuilt positionally. A null
/// cell is recorded as `DataType::Invalid` and adds nothing to any group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedResult {
    pub rows_affected: i32,
    pub columns: Vec<String>,
    pub cell_types: Vec<DataType>,
    pub ints: Vec<i32>,
    pub nums: Vec<f64>,
    pub bytes: Vec<Vec<u8>>,
}

fn fixed<const N: usize>(data: &[u8]) -> Result<[u8; N]> {
    data.get(..N)
        .and_then(|s| s.try_into().ok())
        .ok_or(DbError::ResultSetError)
}

impl FetchedResult {
    pub fn row_count(rows_affected: i32) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    pub fn with_columns(columns: Vec<String>) -> Self {
        Self {
            rows_affected: -1,
            columns,
            ..Self::default()
        }
    }

    pub fn num_rows(&self) -> usize {
        if self.columns.is_empty() {
            0
        } else {
            self.cell_types.len() / self.columns.len()
        }
    }

    /// Decodes one cell into its type-class group.
    pub fn push_cell(&mut self, value: ColumnValue) -> Result<()> {
        if value.is_null {
            self.cell_types.push(DataType::Invalid);
            return Ok(());
        }
        let data = &value.data;
        match value.data_type {
            DataType::Val32 => self.ints.push(i32::from_ne_bytes(fixed(data)?)),
            DataType::Val16 => self.ints.push(i16::from_ne_bytes(fixed(data)?) as i32),
            DataType::UVal16 => self.ints.push(u16::from_ne_bytes(fixed(data)?) as i32),
            DataType::Val8 => self.ints.push(i8::from_ne_bytes(fixed(data)?) as i32),
            DataType::UVal8 => self.ints.push(u8::from_ne_bytes(fixed(data)?) as i32),
            DataType::UVal32 => self.nums.push(u32::from_ne_bytes(fixed(data)?) as f64),
            DataType::Val64 => self.nums.push(i64::from_ne_bytes(fixed(data)?) as f64),
            DataType::UVal64 => self.nums.push(u64::from_ne_bytes(fixed(data)?) as f64),
            DataType::Double => self.nums.push(f64::from_ne_bytes(fixed(data)?)),
            DataType::String | DataType::Binary => self.bytes.push(value.data),
            DataType::Invalid => return Err(DbError::ResultSetError),
        }
        self.cell_types.push(value.data_type);
        Ok(())
    }

    /// Total values held across the type-class groups.
    pub fn value_count(&self) -> usize {
        self.ints.len() + self.nums.len() + self.bytes.len()
    }

    /// Rebuilds rows positionally from the grouped values.
    pub fn into_result(self) -> Result<QueryResult> {
        if self.rows_affected >= 0 {
            return Ok(QueryResult::RowCount(self.rows_affected));
        }
        if self.columns.is_empty() {
            return Ok(QueryResult::Empty);
        }

        let ncols = self.columns.len();
        if self.cell_types.len() % ncols != 0 {
            return Err(DbError::ResultSetError);
        }
        let nulls = self
            .cell_types
            .iter()
            .filter(|t| **t == DataType::Invalid)
            .count();
        if self.value_count() + nulls != self.cell_types.len() {
            return Err(DbError::ResultSetError);
        }

        let columns: Arc<[String]> = self.columns.into();
        let mut ints = self.ints.into_iter();
        let mut nums = self.nums.into_iter();
        let mut bytes = self.bytes.into_iter();
        let mut rows = Vec::with_capacity(self.cell_types.len() / ncols);

        for cells in self.cell_types.chunks(ncols) {
            let mut values = Vec::with_capacity(ncols);
            for ty in cells {
                let value = match ty.type_class() {
                    TypeClass::Integer => Value::Integer(ints.next().ok_or(DbError::ResultSetError)?),
                    TypeClass::Number => Value::Number(nums.next().ok_or(DbError::ResultSetError)?),
                    TypeClass::Bytes => {
                        let data = bytes.next().ok_or(DbError::ResultSetError)?;
                        if *ty == DataType::Binary {
                            Value::Binary(data)
                        } else {
                            Value::String(String::from_utf8_lossy(&data).into_owned())
                        }
                    }
                    TypeClass::Invalid => Value::Null,
                };
                values.push(value);
            }
            rows.push(Row::new(columns.clone(), values));
        }

        Ok(QueryResult::Rows(rows))
    }
}

/// Reads the outcome of a successful execute: the affected-row count for a
/// non-query statement, otherwise column names and every row.
///
/// Must be called with the owning connection's lock held.
pub fn fetch_result_set(
    client: &dyn NativeClient,
    conn: ConnHandle,
    stmt: StmtHandle,
) -> Result<FetchedResult> {
    let rows_affected = client.affected_rows(stmt);
    let num_cols = client.num_cols(stmt);

    if rows_affected > 0 && num_cols < 1 {
        return Ok(FetchedResult::row_count(rows_affected));
    }
    if num_cols < 1 {
        return Ok(FetchedResult::with_columns(Vec::new()));
    }

    let ncols = num_cols as u32;
    let mut columns = Vec::with_capacity(ncols as usize);
    for i in 0..ncols {
        let info = client
            .get_column_info(stmt, i)
            .ok_or_else(|| DbError::from(client.error(conn)))?;
        columns.push(info.name);
    }

    let mut fetched = FetchedResult::with_columns(columns);
    while client.fetch_next(stmt) {
        for i in 0..ncols {
            let value = client
                .get_column(stmt, i)
                .ok_or_else(|| DbError::from(client.error(conn)))?;
            fetched.push_cell(value)?;
        }
    }
    Ok(fetched)
}
