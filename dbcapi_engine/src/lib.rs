pub mod api;
pub mod async_bridge;
pub mod config;
pub mod driver;
pub mod engine;
mod error;
pub mod ffi;
pub mod native;
pub mod observability;
pub mod protocol;
#[cfg(feature = "test-helpers")]
pub mod test_helpers;
pub mod versioning;

pub use api::{create_connection, Arg, Callback, Connection, Outcome, Statement};
pub use config::EngineConfig;
pub use driver::DriverContext;
pub use error::{DbError, ErrorCategory, Result, StructuredError, ERROR_BUFFER_SIZE};
pub use protocol::{
    deserialize_bind_params, deserialize_params, serialize_bind_params, serialize_params,
    BindParams, ParamValue, QueryResult, ResultDecoder, ResultEncoder, Row, Value,
};
