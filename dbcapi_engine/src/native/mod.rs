#[cfg(feature = "dbcapi")]
pub mod dbcapi;
#[cfg(any(test, feature = "test-helpers"))]
pub mod fake;

use crate::config::EngineConfig;
use crate::error::{DbError, Result};
use crate::protocol::bind::BoundParam;
use crate::protocol::types::{DataType, NativeType};
use crate::versioning::ApiVersion;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Opaque native connection object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnHandle(NonZeroUsize);

/// Opaque native prepared statement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StmtHandle(NonZeroUsize);

impl ConnHandle {
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    pub fn as_raw(self) -> usize {
        self.0.get()
    }
}

impl StmtHandle {
    pub fn from_raw(raw: usize) -> Option<Self> {
        NonZeroUsize::new(raw).map(Self)
    }

    pub fn as_raw(self) -> usize {
        self.0.get()
    }
}

/// Address of a connection owned by someone else (an embedded SQL `SQLCA`),
/// wrapped with `make_connection`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExternalHandle(pub usize);

/// Code and message of the last failure on a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeError {
    pub code: i32,
    pub message: String,
}

impl From<NativeError> for DbError {
    fn from(err: NativeError) -> Self {
        DbError::native(err.code, err.message)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamDirection {
    Invalid,
    Input,
    Output,
    InputOutput,
}

impl ParamDirection {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Input,
            2 => Self::Output,
            3 => Self::InputOutput,
            _ => Self::Invalid,
        }
    }
}

/// What a prepared statement expects in one parameter slot.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamDescription {
    pub name: Option<String>,
    pub direction: ParamDirection,
    pub data_type: DataType,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: DataType,
    pub native_type: NativeType,
    pub precision: u16,
    pub scale: u16,
    pub max_size: usize,
    pub nullable: bool,
}

/// One fetched cell, copied out of native memory. `data` holds the value
/// in native byte order for fixed-width types.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnValue {
    pub data_type: DataType,
    pub is_null: bool,
    pub data: Vec<u8>,
}

/// Function surface of the native client library.
///
/// Every call blocks the calling thread. At most one call may be in flight
/// per connection handle; callers uphold that, implementations do not
/// check it. `cancel` is the exception and may be called concurrently.
pub trait NativeClient: Send + Sync {
    /// Negotiates the protocol version. `Err` carries the highest version the
    /// library supports when the requested one is refused.
    fn init(&self, app_name: &str, version: ApiVersion) -> std::result::Result<ApiVersion, ApiVersion>;
    fn fini(&self);

    fn new_connection(&self) -> Option<ConnHandle>;
    fn make_connection(&self, external: ExternalHandle) -> Option<ConnHandle>;
    fn connect(&self, conn: ConnHandle, conn_str: &str) -> bool;
    fn disconnect(&self, conn: ConnHandle) -> bool;
    fn free_connection(&self, conn: ConnHandle);

    fn prepare(&self, conn: ConnHandle, sql: &str) -> Option<StmtHandle>;
    fn free_stmt(&self, stmt: StmtHandle);
    fn reset(&self, stmt: StmtHandle) -> bool;
    fn describe_bind_param(&self, stmt: StmtHandle, index: u32) -> Option<ParamDescription>;
    /// Binds one slot. Buffers referenced by `param` stay valid until the
    /// next `execute` or `reset` on `stmt`.
    fn bind_param(&self, stmt: StmtHandle, index: u32, param: &BoundParam<'_>) -> bool;
    fn set_batch_size(&self, stmt: StmtHandle, rows: u32) -> bool;
    fn execute(&self, stmt: StmtHandle) -> bool;
    fn affected_rows(&self, stmt: StmtHandle) -> i32;
    fn num_cols(&self, stmt: StmtHandle) -> i32;
    fn get_column_info(&self, stmt: StmtHandle, index: u32) -> Option<ColumnInfo>;
    fn fetch_next(&self, stmt: StmtHandle) -> bool;
    fn get_column(&self, stmt: StmtHandle, index: u32) -> Option<ColumnValue>;
    fn get_next_result(&self, stmt: StmtHandle) -> bool;

    fn commit(&self, conn: ConnHandle) -> bool;
    fn rollback(&self, conn: ConnHandle) -> bool;
    fn error(&self, conn: ConnHandle) -> NativeError;
    fn cancel(&self, conn: ConnHandle);
}

/// Produces the native client the first time a connection needs one.
pub trait ClientLoader: Send + Sync {
    fn load(&self, config: &EngineConfig) -> Result<Arc<dyn NativeClient>>;
}

/// Loader that always hands out the same client instance.
pub struct StaticLoader {
    client: Arc<dyn NativeClient>,
}

impl StaticLoader {
    pub fn new(client: Arc<dyn NativeClient>) -> Self {
        Self { client }
    }
}

impl ClientLoader for StaticLoader {
    fn load(&self, _config: &EngineConfig) -> Result<Arc<dyn NativeClient>> {
        Ok(self.client.clone())
    }
}

/// Loader used when no client library support is compiled in.
pub struct UnavailableLoader;

impl ClientLoader for UnavailableLoader {
    fn load(&self, _config: &EngineConfig) -> Result<Arc<dyn NativeClient>> {
        log::warn!("no native client library support compiled in");
        Err(DbError::InitializationFailed)
    }
}

/// Loader for the platform's client library when the `dbcapi` feature is on.
pub fn default_loader() -> Arc<dyn ClientLoader> {
    #[cfg(feature = "dbcapi")]
    {
        Arc::new(dbcapi::DbcapiLoader)
    }
    #[cfg(not(feature = "dbcapi"))]
    {
        Arc::new(UnavailableLoader)
    }
}
