/// Wire type of a bound parameter or fetched column value.
///
/// Discriminants match the client library's `a_sqlany_data_type`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    Invalid = 0,
    Binary = 1,
    String = 2,
    Double = 3,
    Val64 = 4,
    UVal64 = 5,
    Val32 = 6,
    UVal32 = 7,
    Val16 = 8,
    UVal16 = 9,
    Val8 = 10,
    UVal8 = 11,
}

/// Managed representation a wire type decodes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeClass {
    /// 32-bit signed integer
    Integer,
    /// double precision number
    Number,
    /// length-delimited byte payload (string or binary)
    Bytes,
    /// no managed representation
    Invalid,
}

impl DataType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        let ty = match raw {
            0 => Self::Invalid,
            1 => Self::Binary,
            2 => Self::String,
            3 => Self::Double,
            4 => Self::Val64,
            5 => Self::UVal64,
            6 => Self::Val32,
            7 => Self::UVal32,
            8 => Self::Val16,
            9 => Self::UVal16,
            10 => Self::Val8,
            11 => Self::UVal8,
            _ => return None,
        };
        Some(ty)
    }

    /// Single dispatch table for fetch and bind semantics.
    ///
    /// Unsigned 32-bit and both 64-bit integers do not fit an `i32` and are
    /// surfaced as doubles.
    pub fn type_class(self) -> TypeClass {
        match self {
            Self::Val32 | Self::Val16 | Self::UVal16 | Self::Val8 | Self::UVal8 => {
                TypeClass::Integer
            }
            Self::UVal32 | Self::Val64 | Self::UVal64 | Self::Double => TypeClass::Number,
            Self::String | Self::Binary => TypeClass::Bytes,
            Self::Invalid => TypeClass::Invalid,
        }
    }

    /// Width in bytes of a fixed-size value, `None` for variable-length types.
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Double | Self::Val64 | Self::UVal64 => Some(8),
            Self::Val32 | Self::UVal32 => Some(4),
            Self::Val16 | Self::UVal16 => Some(2),
            Self::Val8 | Self::UVal8 => Some(1),
            Self::String | Self::Binary | Self::Invalid => None,
        }
    }
}

/// Column type as described by the server (embedded SQL `DT_*` codes).
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NativeType {
    NoType = 0,
    Date = 384,
    Time = 388,
    Timestamp = 392,
    Varchar = 448,
    FixChar = 452,
    LongVarchar = 456,
    String = 460,
    Double = 480,
    Float = 482,
    Decimal = 484,
    Int = 496,
    SmallInt = 500,
    Binary = 524,
    LongBinary = 528,
    TinyInt = 604,
    BigInt = 608,
    UnsInt = 612,
    UnsSmallInt = 616,
    UnsBigInt = 620,
    Bit = 624,
    NString = 628,
    NFixChar = 632,
    NVarchar = 636,
    LongNVarchar = 640,
}

impl NativeType {
    /// Unknown codes collapse to `NoType`; the native type is informational.
    pub fn from_code(code: u32) -> Self {
        match code {
            384 => Self::Date,
            388 => Self::Time,
            392 => Self::Timestamp,
            448 => Self::Varchar,
            452 => Self::FixChar,
            456 => Self::LongVarchar,
            460 => Self::String,
            480 => Self::Double,
            482 => Self::Float,
            484 => Self::Decimal,
            496 => Self::Int,
            500 => Self::SmallInt,
            524 => Self::Binary,
            528 => Self::LongBinary,
            604 => Self::TinyInt,
            608 => Self::BigInt,
            612 => Self::UnsInt,
            616 => Self::UnsSmallInt,
            620 => Self::UnsBigInt,
            624 => Self::Bit,
            628 => Self::NString,
            632 => Self::NFixChar,
            636 => Self::NVarchar,
            640 => Self::LongNVarchar,
            _ => Self::NoType,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_repr_values() {
        assert_eq!(DataType::Invalid as u32, 0);
        assert_eq!(DataType::Binary as u32, 1);
        assert_eq!(DataType::String as u32, 2);
        assert_eq!(DataType::Double as u32, 3);
        assert_eq!(DataType::Val32 as u32, 6);
        assert_eq!(DataType::UVal8 as u32, 11);
    }

    #[test]
    fn test_from_raw_roundtrip() {
        for raw in 0..=11u32 {
            let ty = DataType::from_raw(raw).expect("known type");
            assert_eq!(ty as u32, raw);
        }
        assert_eq!(DataType::from_raw(12), None);
    }

    #[test]
    fn test_type_class_integers() {
        for ty in [
            DataType::Val32,
            DataType::Val16,
            DataType::UVal16,
            DataType::Val8,
            DataType::UVal8,
        ] {
            assert_eq!(ty.type_class(), TypeClass::Integer, "{:?}", ty);
        }
    }

    #[test]
    fn test_type_class_numbers() {
        for ty in [
            DataType::UVal32,
            DataType::Val64,
            DataType::UVal64,
            DataType::Double,
        ] {
            assert_eq!(ty.type_class(), TypeClass::Number, "{:?}", ty);
        }
    }

    #[test]
    fn test_type_class_bytes_and_invalid() {
        assert_eq!(DataType::String.type_class(), TypeClass::Bytes);
        assert_eq!(DataType::Binary.type_class(), TypeClass::Bytes);
        assert_eq!(DataType::Invalid.type_class(), TypeClass::Invalid);
    }

    #[test]
    fn test_fixed_width() {
        assert_eq!(DataType::Double.fixed_width(), Some(8));
        assert_eq!(DataType::UVal32.fixed_width(), Some(4));
        assert_eq!(DataType::Val16.fixed_width(), Some(2));
        assert_eq!(DataType::UVal8.fixed_width(), Some(1));
        assert_eq!(DataType::String.fixed_width(), None);
    }

    #[test]
    fn test_native_type_from_code() {
        assert_eq!(NativeType::from_code(496), NativeType::Int);
        assert_eq!(NativeType::from_code(640), NativeType::LongNVarchar);
        assert_eq!(NativeType::from_code(1), NativeType::NoType);
    }
}
