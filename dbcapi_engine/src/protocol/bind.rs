use crate::error::{DbError, Result};
use crate::protocol::param_value::{BindParams, ParamValue};
use crate::protocol::strided::{Stride, StridedBuffer, StridedView};
use crate::protocol::types::DataType;
use serde::{Deserialize, Serialize};

/// How fixed-width values of a multi-row bind are laid out in scratch memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindLayout {
    #[default]
    ColumnWise,
    RowWise,
}

#[derive(Clone, Debug, PartialEq)]
enum SlotValues {
    Fixed(Stride),
    Variable(Vec<Vec<u8>>),
    Empty,
}

#[derive(Clone, Debug, PartialEq)]
struct BindSlot {
    data_type: DataType,
    values: SlotValues,
    lengths: Vec<usize>,
    is_null: Vec<bool>,
}

/// Scratch memory for one execute request: every bind slot plus the byte
/// block fixed-width values live in. Dropped right after the native execute.
#[derive(Clone, Debug, PartialEq)]
pub struct BindSet {
    block: StridedBuffer,
    slots: Vec<BindSlot>,
    num_rows: usize,
    layout: BindLayout,
}

/// Values of one bound parameter as handed to the native client.
#[derive(Clone, Copy, Debug)]
pub enum BoundValues<'a> {
    Fixed(StridedView<'a>),
    Variable(&'a [Vec<u8>]),
    Empty,
}

/// Borrowed view of one bind slot.
#[derive(Clone, Copy, Debug)]
pub struct BoundParam<'a> {
    pub data_type: DataType,
    pub rows: usize,
    pub values: BoundValues<'a>,
    pub lengths: &'a [usize],
    pub is_null: &'a [bool],
}

/// One row of a bound parameter.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BoundCell<'a> {
    Null,
    Fixed(&'a [u8]),
    Bytes(&'a [u8]),
}

impl<'a> BoundParam<'a> {
    /// Same buffers declared under a different wire type.
    pub fn with_type(self, data_type: DataType) -> Self {
        Self { data_type, ..self }
    }

    pub fn is_null_at(&self, row: usize) -> bool {
        self.is_null.get(row).copied().unwrap_or(true)
    }

    /// True when any row carries a value.
    pub fn has_values(&self) -> bool {
        self.is_null.iter().any(|n| !n)
    }

    pub fn cell(&self, row: usize) -> BoundCell<'a> {
        if self.is_null_at(row) {
            return BoundCell::Null;
        }
        match self.values {
            BoundValues::Fixed(view) => view.get(row).map_or(BoundCell::Null, BoundCell::Fixed),
            BoundValues::Variable(values) => values
                .get(row)
                .map_or(BoundCell::Null, |v| BoundCell::Bytes(v.as_slice())),
            BoundValues::Empty => BoundCell::Null,
        }
    }
}

fn wide_column_type(first: &ParamValue) -> DataType {
    match first {
        ParamValue::Integer(_) | ParamValue::Double(_) => DataType::Double,
        ParamValue::String(_) => DataType::String,
        ParamValue::Binary(_) => DataType::Binary,
        ParamValue::Null => DataType::Invalid,
    }
}

fn compatible(column: DataType, value: &ParamValue) -> bool {
    match (column, value) {
        (_, ParamValue::Null) => true,
        (DataType::Double, ParamValue::Integer(_) | ParamValue::Double(_)) => true,
        (DataType::String, ParamValue::String(_)) => true,
        (DataType::Binary, ParamValue::Binary(_)) => true,
        _ => false,
    }
}

/// Checks every row against the first one: equal arity, and per column
/// a value of the first row's kind or null. A column whose first row is
/// null is untyped and may only hold nulls.
pub fn validate_wide_rows(rows: &[Vec<ParamValue>]) -> Result<Vec<DataType>> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let types: Vec<DataType> = first.iter().map(wide_column_type).collect();

    for row in rows {
        if row.len() != types.len() {
            return Err(DbError::BindingParametersFailed);
        }
        for (value, ty) in row.iter().zip(&types) {
            if !compatible(*ty, value) {
                return Err(DbError::BindingParametersFailed);
            }
        }
    }
    Ok(types)
}

fn plan_strides(types: &[DataType], rows: usize, layout: BindLayout) -> (Vec<Option<Stride>>, usize) {
    let widths: Vec<Option<usize>> = types.iter().map(|t| t.fixed_width()).collect();
    match layout {
        BindLayout::ColumnWise => {
            let mut offset = 0;
            let strides = widths
                .iter()
                .map(|w| {
                    w.map(|width| {
                        let s = Stride::contiguous(offset, width, rows);
                        offset = s.end();
                        s
                    })
                })
                .collect();
            (strides, offset)
        }
        BindLayout::RowWise => {
            let row_width: usize = widths.iter().flatten().sum();
            let mut offset = 0;
            let strides = widths
                .iter()
                .map(|w| {
                    w.map(|width| {
                        let s = Stride {
                            offset,
                            stride: row_width,
                            width,
                            count: rows,
                        };
                        offset += width;
                        s
                    })
                })
                .collect();
            (strides, row_width * rows)
        }
    }
}

fn encode_fixed(ty: DataType, value: &ParamValue) -> Option<Vec<u8>> {
    match (ty, value) {
        (DataType::Val32, ParamValue::Integer(n)) => Some(n.to_ne_bytes().to_vec()),
        (DataType::Double, ParamValue::Integer(n)) => Some((*n as f64).to_ne_bytes().to_vec()),
        (DataType::Double, ParamValue::Double(n)) => Some(n.to_ne_bytes().to_vec()),
        _ => None,
    }
}

impl BindSet {
    pub fn build(params: &BindParams, layout: BindLayout) -> Result<Self> {
        match params {
            BindParams::Row(values) => {
                let types: Vec<DataType> = values.iter().map(ParamValue::data_type).collect();
                let rows: Vec<&[ParamValue]> = vec![values.as_slice()];
                Self::fill(&types, &rows, layout)
            }
            BindParams::Wide(rows) if rows.is_empty() => Self::fill(&[], &[], layout),
            BindParams::Wide(rows) => {
                let types = validate_wide_rows(rows)?;
                let rows: Vec<&[ParamValue]> = rows.iter().map(Vec::as_slice).collect();
                Self::fill(&types, &rows, layout)
            }
        }
    }

    fn fill(types: &[DataType], rows: &[&[ParamValue]], layout: BindLayout) -> Result<Self> {
        let num_rows = rows.len().max(1);
        let (strides, block_len) = plan_strides(types, rows.len(), layout);
        let mut block = StridedBuffer::with_len(block_len);
        let mut slots = Vec::with_capacity(types.len());

        for (col, ty) in types.iter().enumerate() {
            let mut lengths = vec![0usize; rows.len()];
            let mut is_null = vec![false; rows.len()];
            let mut variable = Vec::new();

            for (r, row) in rows.iter().enumerate() {
                let value = row.get(col).ok_or(DbError::BindingParametersFailed)?;
                if value.is_null() {
                    is_null[r] = true;
                    variable.push(Vec::new());
                    continue;
                }
                match (strides[col], value) {
                    (Some(stride), _) => {
                        let bytes =
                            encode_fixed(*ty, value).ok_or(DbError::BindingParametersFailed)?;
                        lengths[r] = bytes.len();
                        if !block.write(&stride, r, &bytes) {
                            return Err(DbError::BindingParametersFailed);
                        }
                    }
                    (None, ParamValue::String(s)) if *ty == DataType::String => {
                        lengths[r] = s.len();
                        variable.push(s.as_bytes().to_vec());
                    }
                    (None, ParamValue::Binary(b)) if *ty == DataType::Binary => {
                        lengths[r] = b.len();
                        variable.push(b.clone());
                    }
                    _ => return Err(DbError::BindingParametersFailed),
                }
            }

            let values = match strides[col] {
                Some(stride) => SlotValues::Fixed(stride),
                None if *ty == DataType::Invalid => SlotValues::Empty,
                None => SlotValues::Variable(variable),
            };
            slots.push(BindSlot {
                data_type: *ty,
                values,
                lengths,
                is_null,
            });
        }

        Ok(Self {
            block,
            slots,
            num_rows,
            layout,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn is_wide(&self) -> bool {
        self.num_rows > 1
    }

    pub fn layout(&self) -> BindLayout {
        self.layout
    }

    /// Bytes of fixed-width scratch held by this set.
    pub fn scratch_len(&self) -> usize {
        self.block.len()
    }

    pub fn param(&self, index: usize) -> Option<BoundParam<'_>> {
        let slot = self.slots.get(index)?;
        let values = match &slot.values {
            SlotValues::Fixed(stride) => BoundValues::Fixed(self.block.view(*stride)?),
            SlotValues::Variable(v) => BoundValues::Variable(v.as_slice()),
            SlotValues::Empty => BoundValues::Empty,
        };
        Some(BoundParam {
            data_type: slot.data_type,
            rows: slot.is_null.len(),
            values,
            lengths: &slot.lengths,
            is_null: &slot.is_null,
        })
    }

    pub fn params(&self) -> impl Iterator<Item = BoundParam<'_>> + '_ {
        (0..self.slots.len()).filter_map(move |i| self.param(i))
    }
}
