// Allow FFI functions to dereference raw pointers without being marked unsafe
// This is expected and safe for extern "C" FFI boundaries
#![allow(clippy::not_unsafe_ptr_arg_deref)]

//! C ABI over the [`api`](crate::api) objects.
//!
//! Connections and statements are addressed by numeric ids owned by the
//! calling thread; ids created on one thread are unknown on any other.
//! Calls given a completion function return `-2` right away and deliver
//! their value later from inside [`dbc_poll`] on the same thread.

use crate::api::{Callback, ConnectSpec, Connection, Outcome, Statement};
use crate::async_bridge::WorkDispatcher;
use crate::driver::DriverContext;
use crate::error::{DbError, StructuredError};
use crate::observability::global_metrics;
use crate::protocol::{deserialize_bind_params, BindParams, ResultEncoder};
use crate::versioning::AbiVersion;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::os::raw::{c_char, c_int, c_uint};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

pub const DBC_OK: c_int = 0;
pub const DBC_ERROR: c_int = -1;
pub const DBC_PENDING: c_int = -2;

/// Completion function for asynchronous calls.
///
/// `status` is `0` on success or the error code on failure. `object_id` is
/// the new statement id for `dbc_prepare`, `0` otherwise. On success `data`
/// holds the encoded result (empty for calls without one); on failure it
/// holds the serialized structured error. `data` is only valid during the
/// call.
pub type DbcCompletionFn = extern "C" fn(
    user_data: *mut c_void,
    status: c_int,
    object_id: c_uint,
    data: *const u8,
    data_len: c_uint,
);

/// Error information stored per connection
#[derive(Debug, Clone)]
struct ConnectionError {
    simple_message: String,
    structured: StructuredError,
}

impl ConnectionError {
    fn from_error(err: &DbError) -> Self {
        Self {
            simple_message: err.to_string(),
            structured: err.to_structured(),
        }
    }
}

struct StatementEntry {
    conn_id: u32,
    stmt: Rc<Statement>,
}

#[derive(Default)]
struct Registry {
    driver: Option<Arc<DriverContext>>,
    connections: HashMap<u32, Rc<Connection>>,
    statements: HashMap<u32, StatementEntry>,
    next_conn_id: u32,
    next_stmt_id: u32,
    // Errors not tied to a connection (bad ids, init)
    last_error: Option<ConnectionError>,
    connection_errors: HashMap<u32, ConnectionError>,
}

impl Registry {
    fn driver(&mut self) -> Arc<DriverContext> {
        self.driver.get_or_insert_with(DriverContext::global).clone()
    }

    fn add_connection(&mut self, conn: Connection) -> u32 {
        self.next_conn_id += 1;
        self.connections.insert(self.next_conn_id, Rc::new(conn));
        self.next_conn_id
    }

    fn add_statement(&mut self, conn_id: u32, stmt: Statement) -> u32 {
        self.next_stmt_id += 1;
        self.statements.insert(
            self.next_stmt_id,
            StatementEntry {
                conn_id,
                stmt: Rc::new(stmt),
            },
        );
        self.next_stmt_id
    }
}

thread_local! {
    static REGISTRY: RefCell<Registry> = RefCell::new(Registry::default());
}

fn with_registry<T>(f: impl FnOnce(&mut Registry) -> T) -> T {
    REGISTRY.with(|r| f(&mut r.borrow_mut()))
}

/// Records `err` against `conn_id` (or globally for id 0).
fn set_connection_error(conn_id: u32, err: &DbError) {
    log::debug!("dbc error on connection {}: {}", conn_id, err);
    let entry = ConnectionError::from_error(err);
    with_registry(|r| {
        if conn_id != 0 {
            r.connection_errors.insert(conn_id, entry.clone());
        }
        r.last_error = Some(entry);
    });
}

fn get_connection_error(conn_id: u32) -> Option<ConnectionError> {
    with_registry(|r| {
        if conn_id == 0 {
            r.last_error.clone()
        } else {
            r.connection_errors.get(&conn_id).cloned()
        }
    })
}

fn clear_connection_error(conn_id: u32) {
    with_registry(|r| {
        r.connection_errors.remove(&conn_id);
    });
}

/// Makes the calling thread's future `dbc_connection_new` calls use
/// `driver` instead of the process-wide one.
pub fn set_thread_driver(driver: Arc<DriverContext>) {
    with_registry(|r| r.driver = Some(driver));
}

fn lookup_connection(conn_id: u32) -> Option<Rc<Connection>> {
    let conn = with_registry(|r| r.connections.get(&conn_id).cloned());
    if conn.is_none() {
        set_connection_error(0, &DbError::InvalidObject);
    }
    conn
}

fn lookup_statement(stmt_id: u32) -> Option<(u32, Rc<Statement>)> {
    let entry = with_registry(|r| {
        r.statements
            .get(&stmt_id)
            .map(|e| (e.conn_id, e.stmt.clone()))
    });
    if entry.is_none() {
        set_connection_error(0, &DbError::InvalidObject);
    }
    entry
}

/// Reads an optional C string; `Err` for invalid UTF-8.
fn opt_str(ptr: *const c_char) -> Result<Option<String>, DbError> {
    if ptr.is_null() {
        return Ok(None);
    }
    // Safety: non-null `ptr` must be a valid null-terminated C string that
    // outlives this call
    let c_str = unsafe { CStr::from_ptr(ptr) };
    c_str
        .to_str()
        .map(|s| Some(s.to_string()))
        .map_err(|_| DbError::InvalidArguments)
}

fn read_params(params: *const u8, params_len: c_uint) -> Result<BindParams, DbError> {
    if params.is_null() || params_len == 0 {
        return Ok(BindParams::none());
    }
    // Safety: `params` must be valid for reads of `params_len` bytes
    let data = unsafe { std::slice::from_raw_parts(params, params_len as usize) };
    deserialize_bind_params(data).map_err(|_| DbError::BindingParametersFailed)
}

fn write_output(
    data: &[u8],
    out_buf: *mut u8,
    buf_len: c_uint,
    out_written: *mut c_uint,
) -> Result<(), DbError> {
    if out_written.is_null() {
        return Err(DbError::InvalidArguments);
    }
    // Safety: `out_written` is non-null and must be valid for one write
    unsafe {
        *out_written = data.len() as c_uint;
    }
    if data.is_empty() {
        return Ok(());
    }
    if out_buf.is_null() || data.len() > buf_len as usize {
        return Err(DbError::Internal(format!(
            "Buffer too small: need {} bytes, got {}",
            data.len(),
            buf_len
        )));
    }
    // Safety: `out_buf` must be valid for writes of `buf_len` bytes, and
    // `data.len() <= buf_len` was checked above
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), out_buf, data.len());
    }
    Ok(())
}

/// Wraps a C completion function into an api callback. Statements
/// delivered by the callback are registered under `conn_id` first.
fn completion(conn_id: u32, func: DbcCompletionFn, user_data: *mut c_void) -> Callback {
    Callback::new(move |err, outcome| {
        let (status, object_id, data) = match err {
            Some(err) => {
                set_connection_error(conn_id, &err);
                (err.code(), 0, err.to_structured().serialize())
            }
            None => match outcome {
                Outcome::Done => (DBC_OK, 0, Vec::new()),
                Outcome::Result(result) => (DBC_OK, 0, ResultEncoder::encode(&result)),
                Outcome::Statement(stmt) => {
                    let id = with_registry(|r| r.add_statement(conn_id, stmt));
                    (DBC_OK, id, Vec::new())
                }
            },
        };
        func(
            user_data,
            status,
            object_id,
            data.as_ptr(),
            data.len() as c_uint,
        );
    })
}

/// Maps an api call result onto a return code, recording failures.
fn status(conn_id: u32, async_call: bool, result: Result<Outcome, DbError>) -> c_int {
    match result {
        Ok(_) if async_call => DBC_PENDING,
        Ok(_) => {
            clear_connection_error(conn_id);
            DBC_OK
        }
        Err(err) => {
            set_connection_error(conn_id, &err);
            DBC_ERROR
        }
    }
}

fn status_with_result(
    conn_id: u32,
    async_call: bool,
    result: Result<Outcome, DbError>,
    out_buf: *mut u8,
    buf_len: c_uint,
    out_written: *mut c_uint,
) -> c_int {
    match result {
        Ok(_) if async_call => DBC_PENDING,
        Ok(outcome) => {
            let data = outcome
                .into_result()
                .map(|r| ResultEncoder::encode(&r))
                .unwrap_or_default();
            status(
                conn_id,
                false,
                write_output(&data, out_buf, buf_len, out_written).map(|_| Outcome::Done),
            )
        }
        Err(err) => status(conn_id, false, Err(err)),
    }
}

/// Loads the engine configuration and creates the process-wide driver
/// context. The native library itself is loaded on the first connect.
/// Returns: 0 on success, -1 on error
#[no_mangle]
pub extern "C" fn dbc_init() -> c_int {
    let driver = with_registry(|r| r.driver());
    match driver.config().validate() {
        Ok(()) => DBC_OK,
        Err(e) => {
            set_connection_error(0, &e);
            DBC_ERROR
        }
    }
}

/// Returns: this library's C ABI version packed as `major << 16 | minor`
#[no_mangle]
pub extern "C" fn dbc_abi_version() -> c_uint {
    AbiVersion::current().packed()
}

/// Create an unconnected connection
/// base: optional null-terminated connection string fragment used as the
/// base of every later connect
/// Returns: connection ID (>0) on success, 0 on failure
#[no_mangle]
pub extern "C" fn dbc_connection_new(base: *const c_char) -> c_uint {
    let base = match opt_str(base) {
        Ok(b) => b,
        Err(e) => {
            set_connection_error(0, &e);
            return 0;
        }
    };
    let driver = with_registry(|r| r.driver());
    let args = base.map(crate::api::Arg::String).into_iter().collect();
    match Connection::with_driver(driver, args) {
        Ok(conn) => with_registry(|r| r.add_connection(conn)),
        Err(e) => {
            set_connection_error(0, &e);
            0
        }
    }
}

/// Connect
/// conn_str: optional null-terminated fragment appended to the base
/// callback: optional completion function; when given, returns -2
/// Returns: 0 on success, -1 on error, -2 when pending
#[no_mangle]
pub extern "C" fn dbc_connect(
    conn_id: c_uint,
    conn_str: *const c_char,
    callback: Option<DbcCompletionFn>,
    user_data: *mut c_void,
) -> c_int {
    let Some(conn) = lookup_connection(conn_id) else {
        return DBC_ERROR;
    };
    let spec = match opt_str(conn_str) {
        Ok(Some(fragment)) => ConnectSpec::Fragment(fragment),
        Ok(None) => ConnectSpec::Base,
        Err(e) => return status(conn_id, false, Err(e)),
    };
    let cb = callback.map(|f| completion(conn_id, f, user_data));
    status(conn_id, callback.is_some(), conn.connect_with(spec, cb))
}

/// Connect using a connection handle owned by the host application.
/// The engine never disconnects such a handle.
/// Returns: 0 on success, -1 on error, -2 when pending
#[no_mangle]
pub extern "C" fn dbc_connect_external(
    conn_id: c_uint,
    handle: usize,
    callback: Option<DbcCompletionFn>,
    user_data: *mut c_void,
) -> c_int {
    let Some(conn) = lookup_connection(conn_id) else {
        return DBC_ERROR;
    };
    let cb = callback.map(|f| completion(conn_id, f, user_data));
    status(
        conn_id,
        callback.is_some(),
        conn.connect_with(ConnectSpec::External(handle), cb),
    )
}

/// Disconnect
/// Returns: 0 on success, -1 on error, -2 when pending
#[no_mangle]
pub extern "C" fn dbc_disconnect(
    conn_id: c_uint,
    callback: Option<DbcCompletionFn>,
    user_data: *mut c_void,
) -> c_int {
    let Some(conn) = lookup_connection(conn_id) else {
        return DBC_ERROR;
    };
    let cb = callback.map(|f| completion(conn_id, f, user_data));
    status(conn_id, callback.is_some(), conn.disconnect_with(cb))
}

/// Returns: 1 if connected, 0 if not, -1 for an unknown connection ID
#[no_mangle]
pub extern "C" fn dbc_connected(conn_id: c_uint) -> c_int {
    match lookup_connection(conn_id) {
        Some(conn) => c_int::from(conn.connected()),
        None => DBC_ERROR,
    }
}

/// Commit the current transaction
/// Returns: 0 on success, -1 on error, -2 when pending
#[no_mangle]
pub extern "C" fn dbc_commit(
    conn_id: c_uint,
    callback: Option<DbcCompletionFn>,
    user_data: *mut c_void,
) -> c_int {
    let Some(conn) = lookup_connection(conn_id) else {
        return DBC_ERROR;
    };
    let args = callback
        .map(|f| crate::api::Arg::Function(completion(conn_id, f, user_data)))
        .into_iter()
        .collect();
    status(conn_id, callback.is_some(), conn.commit(args))
}

/// Roll back the current transaction
/// Returns: 0 on success, -1 on error, -2 when pending
#[no_mangle]
pub extern "C" fn dbc_rollback(
    conn_id: c_uint,
    callback: Option<DbcCompletionFn>,
    user_data: *mut c_void,
) -> c_int {
    let Some(conn) = lookup_connection(conn_id) else {
        return DBC_ERROR;
    };
    let args = callback
        .map(|f| crate::api::Arg::Function(completion(conn_id, f, user_data)))
        .into_iter()
        .collect();
    status(conn_id, callback.is_some(), conn.rollback(args))
}

/// Abort the request currently running on the connection. Safe to call
/// while an asynchronous call on the same connection is pending.
/// Returns: 0 on success, -1 on error
#[no_mangle]
pub extern "C" fn dbc_cancel(conn_id: c_uint) -> c_int {
    let Some(conn) = lookup_connection(conn_id) else {
        return DBC_ERROR;
    };
    status(conn_id, false, conn.cancel().map(|_| Outcome::Done))
}

/// Execute SQL directly
/// sql: null-terminated UTF-8 SQL
/// params/params_len: optional bind parameters in the binary parameter
/// format (row markers select a wide bind)
/// out_buf/buf_len/out_written: encoded result for synchronous calls;
/// `out_written` receives the needed size even when the buffer is too small
/// Returns: 0 on success, -1 on error, -2 when pending
#[no_mangle]
pub extern "C" fn dbc_exec(
    conn_id: c_uint,
    sql: *const c_char,
    params: *const u8,
    params_len: c_uint,
    out_buf: *mut u8,
    buf_len: c_uint,
    out_written: *mut c_uint,
    callback: Option<DbcCompletionFn>,
    user_data: *mut c_void,
) -> c_int {
    let Some(conn) = lookup_connection(conn_id) else {
        return DBC_ERROR;
    };
    let sql = match opt_str(sql) {
        Ok(Some(sql)) => sql,
        Ok(None) => return status(conn_id, false, Err(DbError::InvalidArguments)),
        Err(e) => return status(conn_id, false, Err(e)),
    };
    let async_call = callback.is_some();
    let cb = callback.map(|f| completion(conn_id, f, user_data));
    let result = match read_params(params, params_len) {
        Ok(params) => conn.exec_with(sql, params, cb),
        Err(e) => crate::api::connection::fail(cb, e),
    };
    status_with_result(conn_id, async_call, result, out_buf, buf_len, out_written)
}

/// Prepare a statement
/// out_stmt_id: receives the statement ID for synchronous calls; async
/// calls receive it as the completion's `object_id`
/// Returns: 0 on success, -1 on error, -2 when pending
#[no_mangle]
pub extern "C" fn dbc_prepare(
    conn_id: c_uint,
    sql: *const c_char,
    out_stmt_id: *mut c_uint,
    callback: Option<DbcCompletionFn>,
    user_data: *mut c_void,
) -> c_int {
    let Some(conn) = lookup_connection(conn_id) else {
        return DBC_ERROR;
    };
    let sql = match opt_str(sql) {
        Ok(Some(sql)) => sql,
        Ok(None) => return status(conn_id, false, Err(DbError::InvalidArguments)),
        Err(e) => return status(conn_id, false, Err(e)),
    };
    if callback.is_none() && out_stmt_id.is_null() {
        return status(conn_id, false, Err(DbError::InvalidArguments));
    }
    let cb = callback.map(|f| completion(conn_id, f, user_data));
    match conn.prepare_with(sql, cb) {
        Ok(_) if callback.is_some() => DBC_PENDING,
        Ok(outcome) => match outcome.into_statement() {
            Some(stmt) => {
                let id = with_registry(|r| r.add_statement(conn_id, stmt));
                // Safety: `out_stmt_id` checked non-null above
                unsafe {
                    *out_stmt_id = id;
                }
                clear_connection_error(conn_id);
                DBC_OK
            }
            None => status(conn_id, false, Err(DbError::GeneralError)),
        },
        Err(e) => status(conn_id, false, Err(e)),
    }
}

/// Execute a prepared statement. Parameters and output as for `dbc_exec`.
/// Returns: 0 on success, -1 on error, -2 when pending
#[no_mangle]
pub extern "C" fn dbc_stmt_exec(
    stmt_id: c_uint,
    params: *const u8,
    params_len: c_uint,
    out_buf: *mut u8,
    buf_len: c_uint,
    out_written: *mut c_uint,
    callback: Option<DbcCompletionFn>,
    user_data: *mut c_void,
) -> c_int {
    let Some((conn_id, stmt)) = lookup_statement(stmt_id) else {
        return DBC_ERROR;
    };
    let async_call = callback.is_some();
    let cb = callback.map(|f| completion(conn_id, f, user_data));
    let result = match read_params(params, params_len) {
        Ok(params) => stmt.exec_with(params, cb),
        Err(e) => crate::api::connection::fail(cb, e),
    };
    status_with_result(conn_id, async_call, result, out_buf, buf_len, out_written)
}

/// Move a statement to its next result set and return it like
/// `dbc_stmt_exec`. No further result set returns an empty result.
/// Returns: 0 on success, -1 on error, -2 when pending
#[no_mangle]
pub extern "C" fn dbc_stmt_more_results(
    stmt_id: c_uint,
    out_buf: *mut u8,
    buf_len: c_uint,
    out_written: *mut c_uint,
    callback: Option<DbcCompletionFn>,
    user_data: *mut c_void,
) -> c_int {
    let Some((conn_id, stmt)) = lookup_statement(stmt_id) else {
        return DBC_ERROR;
    };
    let async_call = callback.is_some();
    let cb = callback.map(|f| completion(conn_id, f, user_data));
    let result = stmt.more_results_with(cb);
    status_with_result(conn_id, async_call, result, out_buf, buf_len, out_written)
}

/// Free a statement. The statement ID is invalid afterwards.
/// Returns: 0 on success, -1 on error, -2 when pending
#[no_mangle]
pub extern "C" fn dbc_stmt_drop(
    stmt_id: c_uint,
    callback: Option<DbcCompletionFn>,
    user_data: *mut c_void,
) -> c_int {
    let Some((conn_id, stmt)) = lookup_statement(stmt_id) else {
        return DBC_ERROR;
    };
    with_registry(|r| r.statements.remove(&stmt_id));
    let cb = callback.map(|f| completion(conn_id, f, user_data));
    status(conn_id, callback.is_some(), stmt.drop_with(cb))
}

/// Release a connection ID, disconnecting if still connected. Statements
/// of the connection stay addressable but fail with Invalid Object.
/// Returns: 0 on success, -1 for an unknown connection ID
#[no_mangle]
pub extern "C" fn dbc_connection_free(conn_id: c_uint) -> c_int {
    let removed = with_registry(|r| {
        r.connection_errors.remove(&conn_id);
        r.connections.remove(&conn_id)
    });
    match removed {
        Some(conn) => {
            drop(conn);
            DBC_OK
        }
        None => {
            set_connection_error(0, &DbError::InvalidObject);
            DBC_ERROR
        }
    }
}

/// Deliver finished asynchronous calls on the calling thread.
/// timeout_ms: 0 to only deliver what is already finished, otherwise wait
/// up to this long for every pending call
/// Returns: number of completions delivered
#[no_mangle]
pub extern "C" fn dbc_poll(timeout_ms: c_uint) -> c_int {
    let workers = with_registry(|r| r.driver()).config().worker_threads;
    let dispatcher = WorkDispatcher::current(workers);
    if timeout_ms == 0 {
        return dispatcher.run_pending() as c_int;
    }
    let before = dispatcher.pending_count();
    dispatcher.wait_idle_timeout(Duration::from_millis(u64::from(timeout_ms)));
    before.saturating_sub(dispatcher.pending_count()) as c_int
}

/// Get last error message for a connection (0 for the last error overall)
/// buffer: output buffer
/// buffer_len: buffer size in bytes
/// Returns: number of bytes written (excluding null terminator), -1 on error
#[no_mangle]
pub extern "C" fn dbc_get_error(conn_id: c_uint, buffer: *mut c_char, buffer_len: c_uint) -> c_int {
    if buffer.is_null() || buffer_len == 0 {
        return -1;
    }

    let error_msg = get_connection_error(conn_id)
        .map(|e| e.simple_message)
        .unwrap_or_default();
    let msg_bytes = error_msg.as_bytes();
    let copy_len = (msg_bytes.len() as c_uint).min(buffer_len - 1);

    // Safety: `buffer` must be valid for writes of `copy_len + 1` bytes
    // Caller ensures buffer is large enough (buffer_len > 0 verified above)
    unsafe {
        std::ptr::copy_nonoverlapping(msg_bytes.as_ptr(), buffer as *mut u8, copy_len as usize);
        *buffer.add(copy_len as usize) = 0;
    }

    copy_len as c_int
}

/// Get last structured error for a connection (0 for the last error overall)
/// buffer: output buffer for the serialized error (`code: i32`,
/// `len: u32`, message bytes)
/// out_written: actual bytes written, or the needed size if too small
/// Returns: 0 on success (code 0 when there is no error), -1 on error
#[no_mangle]
pub extern "C" fn dbc_get_structured_error(
    conn_id: c_uint,
    buffer: *mut u8,
    buffer_len: c_uint,
    out_written: *mut c_uint,
) -> c_int {
    if buffer.is_null() || out_written.is_null() {
        return -1;
    }

    let error_data = get_connection_error(conn_id)
        .map(|e| e.structured)
        .unwrap_or(StructuredError {
            code: 0,
            message: String::new(),
        })
        .serialize();

    match write_output(&error_data, buffer, buffer_len, out_written) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

/// Get engine metrics as a UTF-8 JSON document (not null-terminated)
/// out_written: actual bytes written, or the needed size if too small
/// Returns: 0 on success, -1 on error
#[no_mangle]
pub extern "C" fn dbc_get_metrics(
    buffer: *mut u8,
    buffer_len: c_uint,
    out_written: *mut c_uint,
) -> c_int {
    if buffer.is_null() || out_written.is_null() {
        return -1;
    }
    let json = global_metrics().snapshot().to_json();
    match write_output(json.as_bytes(), buffer, buffer_len, out_written) {
        Ok(()) => 0,
        Err(e) => {
            set_connection_error(0, &e);
            -1
        }
    }
}
