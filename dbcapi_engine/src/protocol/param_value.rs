use crate::error::{DbError, Result};
use crate::protocol::types::DataType;

const TAG_NULL: u8 = 0;
const TAG_STRING: u8 = 1;
const TAG_INTEGER: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_BINARY: u8 = 4;
/// Terminates one row of a batched parameter buffer.
const TAG_ROW_END: u8 = 0xFF;

/// A single bind value as supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Integer(i32),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
}

/// Parameters of one execute request.
#[derive(Debug, Clone, PartialEq)]
pub enum BindParams {
    /// One row of heterogeneous values; empty means "no parameters".
    Row(Vec<ParamValue>),
    /// Array of rows bound column-wise and executed as one batch.
    Wide(Vec<Vec<ParamValue>>),
}

impl Default for BindParams {
    fn default() -> Self {
        BindParams::Row(Vec::new())
    }
}

impl BindParams {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        match self {
            BindParams::Row(values) => values.is_empty(),
            BindParams::Wide(rows) => rows.is_empty(),
        }
    }

    pub fn is_wide(&self) -> bool {
        matches!(self, BindParams::Wide(rows) if !rows.is_empty())
    }

    /// Number of rows the statement will execute with.
    pub fn row_count(&self) -> usize {
        match self {
            BindParams::Row(_) => 1,
            BindParams::Wide(rows) => rows.len().max(1),
        }
    }
}

impl From<Vec<ParamValue>> for BindParams {
    fn from(values: Vec<ParamValue>) -> Self {
        BindParams::Row(values)
    }
}

impl From<Vec<Vec<ParamValue>>> for BindParams {
    fn from(rows: Vec<Vec<ParamValue>>) -> Self {
        BindParams::Wide(rows)
    }
}

impl ParamValue {
    /// Wire type the caller's value declares. Null declares a string slot.
    pub fn data_type(&self) -> DataType {
        match self {
            ParamValue::Null | ParamValue::String(_) => DataType::String,
            ParamValue::Integer(_) => DataType::Val32,
            ParamValue::Double(_) => DataType::Double,
            ParamValue::Binary(_) => DataType::Binary,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ParamValue::Null)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            ParamValue::Null => {
                out.push(TAG_NULL);
                out.extend_from_slice(&0u32.to_le_bytes());
            }
            ParamValue::String(s) => {
                out.push(TAG_STRING);
                let b = s.as_bytes();
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
            ParamValue::Integer(n) => {
                out.push(TAG_INTEGER);
                out.extend_from_slice(&4u32.to_le_bytes());
                out.extend_from_slice(&n.to_le_bytes());
            }
            ParamValue::Double(n) => {
                out.push(TAG_DOUBLE);
                out.extend_from_slice(&8u32.to_le_bytes());
                out.extend_from_slice(&n.to_le_bytes());
            }
            ParamValue::Binary(b) => {
                out.push(TAG_BINARY);
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
        }
        out
    }

    /// Decodes one value, returning it and the number of bytes consumed.
    /// A row terminator decodes as `None`.
    fn deserialize_entry(data: &[u8]) -> Result<(Option<Self>, usize)> {
        if data.len() < 5 {
            return Err(DbError::InvalidArguments);
        }
        let tag = data[0];
        let len = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
        let consumed = 5usize.saturating_add(len);

        if data.len() < consumed {
            return Err(DbError::InvalidArguments);
        }

        let payload = &data[5..consumed];

        let p = match tag {
            TAG_ROW_END => return Ok((None, consumed)),
            TAG_NULL => ParamValue::Null,
            TAG_STRING => {
                let s = std::str::from_utf8(payload).map_err(|_| DbError::InvalidArguments)?;
                ParamValue::String(s.to_string())
            }
            TAG_INTEGER => {
                let bytes: [u8; 4] = payload.try_into().map_err(|_| DbError::InvalidArguments)?;
                ParamValue::Integer(i32::from_le_bytes(bytes))
            }
            TAG_DOUBLE => {
                let bytes: [u8; 8] = payload.try_into().map_err(|_| DbError::InvalidArguments)?;
                ParamValue::Double(f64::from_le_bytes(bytes))
            }
            TAG_BINARY => ParamValue::Binary(payload.to_vec()),
            _ => return Err(DbError::InvalidArguments),
        };

        Ok((Some(p), consumed))
    }

    pub fn deserialize(data: &[u8]) -> Result<(Self, usize)> {
        match Self::deserialize_entry(data)? {
            (Some(p), n) => Ok((p, n)),
            (None, _) => Err(DbError::InvalidArguments),
        }
    }
}

pub fn serialize_params(params: &[ParamValue]) -> Vec<u8> {
    let mut out = Vec::new();
    for p in params {
        out.extend(p.serialize());
    }
    out
}

pub fn deserialize_params(data: &[u8]) -> Result<Vec<ParamValue>> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < data.len() {
        let (p, n) = ParamValue::deserialize(&data[offset..])?;
        out.push(p);
        offset += n;
    }
    Ok(out)
}

/// Encodes a parameter set. Wide sets terminate every row with a row marker.
pub fn serialize_bind_params(params: &BindParams) -> Vec<u8> {
    match params {
        BindParams::Row(values) => serialize_params(values),
        BindParams::Wide(rows) => {
            let mut out = Vec::new();
            for row in rows {
                out.extend(serialize_params(row));
                out.push(TAG_ROW_END);
                out.extend_from_slice(&0u32.to_le_bytes());
            }
            out
        }
    }
}

/// Decodes a parameter set; the presence of any row marker selects wide
/// binding, in which case the buffer must end on a row marker.
pub fn deserialize_bind_params(data: &[u8]) -> Result<BindParams> {
    let mut rows: Vec<Vec<ParamValue>> = Vec::new();
    let mut current = Vec::new();
    let mut saw_row_end = false;
    let mut offset = 0;

    while offset < data.len() {
        let (entry, n) = ParamValue::deserialize_entry(&data[offset..])?;
        offset += n;
        match entry {
            Some(p) => current.push(p),
            None => {
                saw_row_end = true;
                rows.push(std::mem::take(&mut current));
            }
        }
    }

    if !saw_row_end {
        return Ok(BindParams::Row(current));
    }
    if !current.is_empty() {
        return Err(DbError::InvalidArguments);
    }
    Ok(BindParams::Wide(rows))
}
