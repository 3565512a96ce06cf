pub mod bind;
pub mod decoder;
pub mod encoder;
pub mod fetch;
pub mod param_value;
pub mod result;
pub mod strided;
pub mod types;

pub use bind::{validate_wide_rows, BindLayout, BindSet, BoundCell, BoundParam, BoundValues};
pub use decoder::ResultDecoder;
pub use encoder::ResultEncoder;
pub use fetch::{fetch_result_set, FetchedResult};
pub use param_value::{
    deserialize_bind_params, deserialize_params, serialize_bind_params, serialize_params,
    BindParams, ParamValue,
};
pub use result::{QueryResult, Row, Value};
pub use strided::{Stride, StridedBuffer, StridedView};
pub use types::{DataType, NativeType, TypeClass};
