use super::{
    ClientLoader, ColumnInfo, ColumnValue, ConnHandle, ExternalHandle, NativeClient, NativeError,
    ParamDescription, ParamDirection, StmtHandle,
};
use crate::config::{EngineConfig, LIBRARY_PATH_ENV};
use crate::error::{DbError, Result, ERROR_BUFFER_SIZE};
use crate::protocol::bind::{BoundParam, BoundValues};
use crate::protocol::types::{DataType, NativeType};
use crate::versioning::ApiVersion;
use libloading::Library;
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::path::PathBuf;
use std::ptr;
use std::sync::{Arc, Mutex};

#[cfg(target_os = "windows")]
const DEFAULT_LIBRARY_NAME: &str = "dbcapi.dll";
#[cfg(target_os = "macos")]
const DEFAULT_LIBRARY_NAME: &str = "libdbcapi_r.dylib";
#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const DEFAULT_LIBRARY_NAME: &str = "libdbcapi_r.so";

const DD_INPUT: u32 = 1;

#[repr(C)]
struct RawDataValue {
    buffer: *mut c_char,
    buffer_size: usize,
    length: *mut usize,
    data_type: u32,
    is_null: *mut i32,
    is_address: i32,
}

#[repr(C)]
struct RawBindParam {
    direction: u32,
    value: RawDataValue,
    name: *mut c_char,
}

#[repr(C)]
struct RawColumnInfo {
    name: *mut c_char,
    data_type: u32,
    native_type: u32,
    precision: u16,
    scale: u16,
    max_size: usize,
    nullable: i32,
    table_name: *mut c_char,
    owner_name: *mut c_char,
    is_bound: i32,
    binding: RawDataValue,
}

impl Default for RawDataValue {
    fn default() -> Self {
        Self {
            buffer: ptr::null_mut(),
            buffer_size: 0,
            length: ptr::null_mut(),
            data_type: 0,
            is_null: ptr::null_mut(),
            is_address: 0,
        }
    }
}

impl Default for RawBindParam {
    fn default() -> Self {
        Self {
            direction: 0,
            value: RawDataValue::default(),
            name: ptr::null_mut(),
        }
    }
}

impl Default for RawColumnInfo {
    fn default() -> Self {
        Self {
            name: ptr::null_mut(),
            data_type: 0,
            native_type: 0,
            precision: 0,
            scale: 0,
            max_size: 0,
            nullable: 0,
            table_name: ptr::null_mut(),
            owner_name: ptr::null_mut(),
            is_bound: 0,
            binding: RawDataValue::default(),
        }
    }
}

type InitFn = unsafe extern "C" fn(*const c_char, u32, *mut u32) -> i32;
type FiniFn = unsafe extern "C" fn();
type NewConnectionFn = unsafe extern "C" fn() -> *mut c_void;
type MakeConnectionFn = unsafe extern "C" fn(*mut c_void) -> *mut c_void;
type ConnStrFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> i32;
type ConnBoolFn = unsafe extern "C" fn(*mut c_void) -> i32;
type ConnVoidFn = unsafe extern "C" fn(*mut c_void);
type PrepareFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;
type StmtVoidFn = unsafe extern "C" fn(*mut c_void);
type StmtBoolFn = unsafe extern "C" fn(*mut c_void) -> i32;
type StmtI32Fn = unsafe extern "C" fn(*mut c_void) -> i32;
type BindParamFn = unsafe extern "C" fn(*mut c_void, u32, *mut RawBindParam) -> i32;
type SetBatchSizeFn = unsafe extern "C" fn(*mut c_void, u32) -> i32;
type GetColumnFn = unsafe extern "C" fn(*mut c_void, u32, *mut RawDataValue) -> i32;
type GetColumnInfoFn = unsafe extern "C" fn(*mut c_void, u32, *mut RawColumnInfo) -> i32;
type ErrorFn = unsafe extern "C" fn(*mut c_void, *mut c_char, usize) -> i32;

struct Api {
    init: InitFn,
    fini: FiniFn,
    new_connection: NewConnectionFn,
    free_connection: ConnVoidFn,
    make_connection: MakeConnectionFn,
    connect: ConnStrFn,
    disconnect: ConnBoolFn,
    prepare: PrepareFn,
    free_stmt: StmtVoidFn,
    describe_bind_param: BindParamFn,
    bind_param: BindParamFn,
    reset: StmtBoolFn,
    execute: StmtBoolFn,
    fetch_next: StmtBoolFn,
    get_next_result: StmtBoolFn,
    affected_rows: StmtI32Fn,
    num_cols: StmtI32Fn,
    get_column: GetColumnFn,
    get_column_info: GetColumnInfoFn,
    commit: ConnBoolFn,
    rollback: ConnBoolFn,
    error: ErrorFn,
    cancel: ConnVoidFn,
    set_batch_size: Option<SetBatchSizeFn>,
}

fn required<T: Copy>(library: &Library, name: &str) -> Result<T> {
    let symbol = format!("{}\0", name);
    // SAFETY: T is the documented signature of `name` in the client API.
    unsafe { library.get::<T>(symbol.as_bytes()) }
        .map(|s| *s)
        .map_err(|e| {
            log::warn!("client library is missing {}: {}", name, e);
            DbError::InitializationFailed
        })
}

fn optional<T: Copy>(library: &Library, name: &str) -> Option<T> {
    let symbol = format!("{}\0", name);
    // SAFETY: as in `required`.
    unsafe { library.get::<T>(symbol.as_bytes()) }
        .map(|s| *s)
        .ok()
}

impl Api {
    fn resolve(library: &Library) -> Result<Self> {
        Ok(Self {
            init: required(library, "sqlany_init")?,
            fini: required(library, "sqlany_fini")?,
            new_connection: required(library, "sqlany_new_connection")?,
            free_connection: required(library, "sqlany_free_connection")?,
            make_connection: required(library, "sqlany_make_connection")?,
            connect: required(library, "sqlany_connect")?,
            disconnect: required(library, "sqlany_disconnect")?,
            prepare: required(library, "sqlany_prepare")?,
            free_stmt: required(library, "sqlany_free_stmt")?,
            describe_bind_param: required(library, "sqlany_describe_bind_param")?,
            bind_param: required(library, "sqlany_bind_param")?,
            reset: required(library, "sqlany_reset")?,
            execute: required(library, "sqlany_execute")?,
            fetch_next: required(library, "sqlany_fetch_next")?,
            get_next_result: required(library, "sqlany_get_next_result")?,
            affected_rows: required(library, "sqlany_affected_rows")?,
            num_cols: required(library, "sqlany_num_cols")?,
            get_column: required(library, "sqlany_get_column")?,
            get_column_info: required(library, "sqlany_get_column_info")?,
            commit: required(library, "sqlany_commit")?,
            rollback: required(library, "sqlany_rollback")?,
            error: required(library, "sqlany_error")?,
            cancel: required(library, "sqlany_cancel")?,
            set_batch_size: optional(library, "sqlany_set_batch_size"),
        })
    }
}

/// Native memory referenced by one bound parameter until the statement
/// executes or is reset.
struct BindScratch {
    gathered: Vec<u8>,
    pointers: Vec<*mut c_char>,
    lengths: Vec<usize>,
    nulls: Vec<i32>,
}

// The pointers reference buffers owned by the caller's bind set, which
// outlives the execute; the scratch only moves between pool threads.
unsafe impl Send for BindScratch {}

/// The SQL Anywhere C client library, loaded at runtime.
pub struct DbcapiLibrary {
    api: Api,
    scratch: Mutex<HashMap<usize, Vec<BindScratch>>>,
    path: PathBuf,
    _library: Library,
}

fn candidates(config: &EngineConfig) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(path) = &config.library_path {
        paths.push(path.clone());
    }
    if let Ok(path) = std::env::var(LIBRARY_PATH_ENV) {
        if !path.trim().is_empty() {
            paths.push(PathBuf::from(path));
        }
    }
    paths.push(PathBuf::from(DEFAULT_LIBRARY_NAME));
    paths.dedup();
    paths
}

fn conn_ptr(conn: ConnHandle) -> *mut c_void {
    conn.as_raw() as *mut c_void
}

fn stmt_ptr(stmt: StmtHandle) -> *mut c_void {
    stmt.as_raw() as *mut c_void
}

fn c_string_lossy(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: the client returns NUL-terminated strings it keeps alive for
    // the duration of the call that produced them.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

impl DbcapiLibrary {
    /// Loads the first library that opens and exports every required
    /// entry point: the configured path, `SQLANY_API_DLL`, then the
    /// platform default name.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        for path in candidates(config) {
            // SAFETY: loading runs the library's initialisers; the client
            // library has no unusual requirements there.
            let library = match unsafe { Library::new(&path) } {
                Ok(library) => library,
                Err(e) => {
                    log::debug!("could not load {}: {}", path.display(), e);
                    continue;
                }
            };
            let api = Api::resolve(&library)?;
            log::debug!("loaded client library {}", path.display());
            return Ok(Self {
                api,
                scratch: Mutex::new(HashMap::new()),
                path,
                _library: library,
            });
        }
        log::warn!("no client library could be loaded");
        Err(DbError::InitializationFailed)
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn supports_batch_size(&self) -> bool {
        self.api.set_batch_size.is_some()
    }

    fn release_scratch(&self, stmt: StmtHandle) {
        if let Ok(mut scratch) = self.scratch.lock() {
            scratch.remove(&stmt.as_raw());
        }
    }

    fn keep_scratch(&self, stmt: StmtHandle, scratch: BindScratch) -> bool {
        match self.scratch.lock() {
            Ok(mut map) => {
                map.entry(stmt.as_raw()).or_default().push(scratch);
                true
            }
            Err(_) => false,
        }
    }
}

impl NativeClient for DbcapiLibrary {
    fn init(&self, app_name: &str, version: ApiVersion) -> std::result::Result<ApiVersion, ApiVersion> {
        let app = CString::new(app_name).unwrap_or_default();
        let mut available = 0u32;
        // SAFETY: `app` outlives the call; `available` is a valid out slot.
        let ok = unsafe { (self.api.init)(app.as_ptr(), version.0, &mut available) };
        if ok != 0 {
            Ok(version)
        } else {
            Err(ApiVersion(available))
        }
    }

    fn fini(&self) {
        // SAFETY: paired with a successful init by the driver context.
        unsafe { (self.api.fini)() }
    }

    fn new_connection(&self) -> Option<ConnHandle> {
        // SAFETY: no arguments; returns null on failure.
        let raw = unsafe { (self.api.new_connection)() };
        ConnHandle::from_raw(raw as usize)
    }

    fn make_connection(&self, external: ExternalHandle) -> Option<ConnHandle> {
        // SAFETY: the caller vouches that `external` is a live SQLCA address.
        let raw = unsafe { (self.api.make_connection)(external.0 as *mut c_void) };
        ConnHandle::from_raw(raw as usize)
    }

    fn connect(&self, conn: ConnHandle, conn_str: &str) -> bool {
        let Ok(conn_str) = CString::new(conn_str) else {
            return false;
        };
        // SAFETY: live connection handle, NUL-terminated string.
        unsafe { (self.api.connect)(conn_ptr(conn), conn_str.as_ptr()) != 0 }
    }

    fn disconnect(&self, conn: ConnHandle) -> bool {
        // SAFETY: live connection handle.
        unsafe { (self.api.disconnect)(conn_ptr(conn)) != 0 }
    }

    fn free_connection(&self, conn: ConnHandle) {
        // SAFETY: the handle is not used again after this call.
        unsafe { (self.api.free_connection)(conn_ptr(conn)) }
    }

    fn prepare(&self, conn: ConnHandle, sql: &str) -> Option<StmtHandle> {
        let sql = CString::new(sql).ok()?;
        // SAFETY: live connection handle, NUL-terminated string.
        let raw = unsafe { (self.api.prepare)(conn_ptr(conn), sql.as_ptr()) };
        StmtHandle::from_raw(raw as usize)
    }

    fn free_stmt(&self, stmt: StmtHandle) {
        // SAFETY: the handle is not used again after this call.
        unsafe { (self.api.free_stmt)(stmt_ptr(stmt)) }
        self.release_scratch(stmt);
    }

    fn reset(&self, stmt: StmtHandle) -> bool {
        // SAFETY: live statement handle.
        let ok = unsafe { (self.api.reset)(stmt_ptr(stmt)) != 0 };
        self.release_scratch(stmt);
        ok
    }

    fn describe_bind_param(&self, stmt: StmtHandle, index: u32) -> Option<ParamDescription> {
        let mut raw = RawBindParam::default();
        // SAFETY: live statement handle; `raw` is a valid out struct.
        if unsafe { (self.api.describe_bind_param)(stmt_ptr(stmt), index, &mut raw) } == 0 {
            return None;
        }
        Some(ParamDescription {
            name: c_string_lossy(raw.name),
            direction: ParamDirection::from_raw(raw.direction),
            data_type: DataType::from_raw(raw.value.data_type).unwrap_or(DataType::Invalid),
        })
    }

    fn bind_param(&self, stmt: StmtHandle, index: u32, param: &BoundParam<'_>) -> bool {
        let rows = param.rows.max(1);
        let mut scratch = BindScratch {
            gathered: Vec::new(),
            pointers: Vec::new(),
            lengths: (0..rows)
                .map(|r| param.lengths.get(r).copied().unwrap_or(0))
                .collect(),
            nulls: (0..rows).map(|r| param.is_null_at(r) as i32).collect(),
        };

        let mut value = RawDataValue::default();
        value.data_type = param.data_type as u32;

        match param.values {
            BoundValues::Fixed(view) => {
                let width = view.layout().width;
                let bytes = match view.as_contiguous() {
                    Some(bytes) => bytes,
                    None => {
                        scratch.gathered = view.gather();
                        &scratch.gathered[..]
                    }
                };
                value.buffer = bytes.as_ptr() as *mut c_char;
                value.buffer_size = width;
            }
            BoundValues::Variable(values) if rows == 1 => {
                if let Some(first) = values.first() {
                    value.buffer = first.as_ptr() as *mut c_char;
                    value.buffer_size = first.len();
                }
            }
            BoundValues::Variable(values) => {
                scratch.pointers = values.iter().map(|v| v.as_ptr() as *mut c_char).collect();
                value.buffer = scratch.pointers.as_mut_ptr() as *mut c_char;
                value.buffer_size = values.iter().map(Vec::len).max().unwrap_or(0);
                value.is_address = 1;
            }
            BoundValues::Empty => {}
        }
        value.length = scratch.lengths.as_mut_ptr();
        value.is_null = scratch.nulls.as_mut_ptr();

        let mut raw = RawBindParam {
            direction: DD_INPUT,
            value,
            name: ptr::null_mut(),
        };
        // SAFETY: every buffer referenced by `raw` lives in `scratch` or in
        // the caller's bind set; both outlive the execute.
        let ok = unsafe { (self.api.bind_param)(stmt_ptr(stmt), index, &mut raw) != 0 };
        ok && self.keep_scratch(stmt, scratch)
    }

    fn set_batch_size(&self, stmt: StmtHandle, rows: u32) -> bool {
        match self.api.set_batch_size {
            // SAFETY: live statement handle.
            Some(f) => unsafe { f(stmt_ptr(stmt), rows) != 0 },
            None => false,
        }
    }

    fn execute(&self, stmt: StmtHandle) -> bool {
        // SAFETY: live statement handle with every parameter bound.
        let ok = unsafe { (self.api.execute)(stmt_ptr(stmt)) != 0 };
        self.release_scratch(stmt);
        ok
    }

    fn affected_rows(&self, stmt: StmtHandle) -> i32 {
        // SAFETY: live statement handle.
        unsafe { (self.api.affected_rows)(stmt_ptr(stmt)) }
    }

    fn num_cols(&self, stmt: StmtHandle) -> i32 {
        // SAFETY: live statement handle.
        unsafe { (self.api.num_cols)(stmt_ptr(stmt)) }
    }

    fn get_column_info(&self, stmt: StmtHandle, index: u32) -> Option<ColumnInfo> {
        let mut raw = RawColumnInfo::default();
        // SAFETY: live statement handle; `raw` is a valid out struct.
        if unsafe { (self.api.get_column_info)(stmt_ptr(stmt), index, &mut raw) } == 0 {
            return None;
        }
        Some(ColumnInfo {
            name: c_string_lossy(raw.name).unwrap_or_default(),
            data_type: DataType::from_raw(raw.data_type).unwrap_or(DataType::Invalid),
            native_type: NativeType::from_code(raw.native_type),
            precision: raw.precision,
            scale: raw.scale,
            max_size: raw.max_size,
            nullable: raw.nullable != 0,
        })
    }

    fn fetch_next(&self, stmt: StmtHandle) -> bool {
        // SAFETY: live statement handle.
        unsafe { (self.api.fetch_next)(stmt_ptr(stmt)) != 0 }
    }

    fn get_column(&self, stmt: StmtHandle, index: u32) -> Option<ColumnValue> {
        let mut raw = RawDataValue::default();
        // SAFETY: live statement handle; `raw` is a valid out struct.
        if unsafe { (self.api.get_column)(stmt_ptr(stmt), index, &mut raw) } == 0 {
            return None;
        }
        let data_type = DataType::from_raw(raw.data_type).unwrap_or(DataType::Invalid);
        // SAFETY: on success the pointers in `raw` reference client memory
        // valid until the next fetch on this statement.
        let is_null = !raw.is_null.is_null() && unsafe { *raw.is_null } != 0;
        if is_null || raw.buffer.is_null() {
            return Some(ColumnValue {
                data_type,
                is_null: true,
                data: Vec::new(),
            });
        }
        let len = match data_type.fixed_width() {
            Some(width) => width.min(raw.buffer_size),
            None if raw.length.is_null() => 0,
            // SAFETY: as above.
            None => unsafe { *raw.length },
        };
        // SAFETY: `buffer` holds at least `len` bytes per the client contract.
        let data = unsafe { std::slice::from_raw_parts(raw.buffer as *const u8, len) }.to_vec();
        Some(ColumnValue {
            data_type,
            is_null: false,
            data,
        })
    }

    fn get_next_result(&self, stmt: StmtHandle) -> bool {
        // SAFETY: live statement handle.
        unsafe { (self.api.get_next_result)(stmt_ptr(stmt)) != 0 }
    }

    fn commit(&self, conn: ConnHandle) -> bool {
        // SAFETY: live connection handle.
        unsafe { (self.api.commit)(conn_ptr(conn)) != 0 }
    }

    fn rollback(&self, conn: ConnHandle) -> bool {
        // SAFETY: live connection handle.
        unsafe { (self.api.rollback)(conn_ptr(conn)) != 0 }
    }

    fn error(&self, conn: ConnHandle) -> NativeError {
        let mut buffer = [0 as c_char; ERROR_BUFFER_SIZE];
        // SAFETY: the client writes at most `buffer.len()` bytes including
        // the terminator.
        let code = unsafe { (self.api.error)(conn_ptr(conn), buffer.as_mut_ptr(), buffer.len()) };
        buffer[ERROR_BUFFER_SIZE - 1] = 0;
        NativeError {
            code,
            message: c_string_lossy(buffer.as_ptr()).unwrap_or_default(),
        }
    }

    fn cancel(&self, conn: ConnHandle) {
        // SAFETY: cancel is the one call the client allows concurrently
        // with another request on the same connection.
        unsafe { (self.api.cancel)(conn_ptr(conn)) }
    }
}

/// Loads [`DbcapiLibrary`] for the driver context.
pub struct DbcapiLoader;

impl ClientLoader for DbcapiLoader {
    fn load(&self, config: &EngineConfig) -> Result<Arc<dyn NativeClient>> {
        Ok(Arc::new(DbcapiLibrary::open(config)?))
    }
}
