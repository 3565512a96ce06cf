use serde::Serialize;
use std::sync::Arc;

/// A materialized cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i32),
    Number(f64),
    String(String),
    Binary(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(n) => Some(*n as f64),
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Binary(b) => Some(b),
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

/// One fetched row; values are positional and named by the shared column list.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn at(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Value of the named column. With duplicate names the rightmost wins,
    /// the way keyed row objects overwrite earlier entries.
    pub fn get(&self, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().rposition(|c| c == column)?;
        self.values.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.columns.iter().map(String::as_str).zip(self.values.iter())
    }
}

impl Serialize for Row {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// What an execute delivers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryResult {
    /// Non-query statement: number of affected rows.
    RowCount(i32),
    /// Query: rows keyed by column name, possibly none.
    Rows(Vec<Row>),
    /// Neither columns nor affected rows.
    Empty,
}

impl QueryResult {
    pub fn row_count(&self) -> Option<i32> {
        match self {
            QueryResult::RowCount(n) => Some(*n),
            _ => None,
        }
    }

    pub fn rows(&self) -> Option<&[Row]> {
        match self {
            QueryResult::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, QueryResult::Empty)
    }
}
