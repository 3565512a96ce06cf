//! C ABI exercised as a C caller would: ids, binary params, encoded
//! results and completion polling.
mod helpers;
use dbcapi_engine::ffi::*;
use dbcapi_engine::{serialize_bind_params, BindParams, ParamValue, ResultDecoder, Value};
use helpers::fake_driver;
use std::cell::RefCell;
use std::ffi::{c_void, CString};
use std::os::raw::{c_int, c_uint};
use std::ptr;

struct Completions(RefCell<Vec<(c_int, c_uint, Vec<u8>)>>);

extern "C" fn on_complete(
    user_data: *mut c_void,
    status: c_int,
    object_id: c_uint,
    data: *const u8,
    data_len: c_uint,
) {
    // Safety: the tests below pass a live `Completions` as user data
    let done = unsafe { &*(user_data as *const Completions) };
    let bytes = if data_len == 0 {
        Vec::new()
    } else {
        // Safety: valid for `data_len` bytes during the call
        unsafe { std::slice::from_raw_parts(data, data_len as usize) }.to_vec()
    };
    done.0.borrow_mut().push((status, object_id, bytes));
}

fn ud(done: &Completions) -> *mut c_void {
    done as *const Completions as *mut c_void
}

#[test]
fn test_wide_insert_through_c_abi() {
    let (fake, ctx) = fake_driver();
    set_thread_driver(ctx.clone());
    assert_eq!(dbc_init(), 0);

    let base = CString::new("UID=dba;PWD=sql").unwrap();
    let conn = dbc_connection_new(base.as_ptr());
    assert!(conn > 0);
    assert_eq!(dbc_connected(conn), 0);
    assert_eq!(dbc_connect(conn, ptr::null(), None, ptr::null_mut()), DBC_OK);
    assert_eq!(dbc_connected(conn), 1);
    assert_eq!(
        fake.last_connection_string().as_deref(),
        Some("UID=dba;PWD=sql;CHARSET='UTF-8'")
    );

    let params = serialize_bind_params(&BindParams::Wide(vec![
        vec![ParamValue::Integer(1), ParamValue::String("a".to_string())],
        vec![ParamValue::Integer(2), ParamValue::String("b".to_string())],
    ]));
    let sql = CString::new("INSERT INTO t VALUES (?, ?) -- AS id AS name").unwrap();
    let mut out = vec![0u8; 1024];
    let mut written: c_uint = 0;
    let rc = dbc_exec(
        conn,
        sql.as_ptr(),
        params.as_ptr(),
        params.len() as c_uint,
        out.as_mut_ptr(),
        out.len() as c_uint,
        &mut written,
        None,
        ptr::null_mut(),
    );
    assert_eq!(rc, DBC_OK);
    let result = ResultDecoder::parse(&out[..written as usize]).unwrap();
    let rows = result.rows().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].get("name"), Some(&Value::String("b".to_string())));

    assert_eq!(dbc_disconnect(conn, None, ptr::null_mut()), DBC_OK);
    assert_eq!(dbc_connection_free(conn), DBC_OK);
    assert_eq!(dbc_connection_free(conn), DBC_ERROR);
    assert_eq!(ctx.open_connections(), 0);
}

#[test]
fn test_async_lifecycle_through_poll() {
    let (_fake, ctx) = fake_driver();
    set_thread_driver(ctx.clone());
    let done = Completions(RefCell::new(Vec::new()));

    let conn = dbc_connection_new(ptr::null());
    assert_eq!(dbc_connect(conn, ptr::null(), Some(on_complete), ud(&done)), DBC_PENDING);
    assert_eq!(dbc_commit(conn, Some(on_complete), ud(&done)), DBC_PENDING);
    assert_eq!(dbc_rollback(conn, Some(on_complete), ud(&done)), DBC_PENDING);

    let mut delivered = 0;
    while delivered < 3 {
        delivered += dbc_poll(1_000);
    }
    let statuses: Vec<c_int> = done.0.borrow().iter().map(|(s, _, _)| *s).collect();
    assert_eq!(statuses.len(), 3);
    // commit/rollback may have raced ahead of connect on the pool
    assert!(statuses.iter().all(|s| *s == 0 || *s == -2005));
    assert_eq!(dbc_connected(conn), 1);

    done.0.borrow_mut().clear();
    assert_eq!(dbc_disconnect(conn, Some(on_complete), ud(&done)), DBC_PENDING);
    while dbc_poll(1_000) == 0 {}
    assert_eq!(done.0.borrow()[0].0, 0);
    assert_eq!(dbc_connected(conn), 0);
    dbc_connection_free(conn);
}

#[test]
fn test_statement_ids_and_more_results() {
    let (fake, ctx) = fake_driver();
    fake.script(
        "CALL two()",
        vec![
            dbcapi_engine::test_helpers::FakeResult::Affected(1),
            dbcapi_engine::test_helpers::FakeResult::Affected(2),
        ],
    );
    set_thread_driver(ctx);
    let conn = dbc_connection_new(ptr::null());
    dbc_connect(conn, ptr::null(), None, ptr::null_mut());

    let sql = CString::new("CALL two()").unwrap();
    let mut stmt: c_uint = 0;
    assert_eq!(dbc_prepare(conn, sql.as_ptr(), &mut stmt, None, ptr::null_mut()), DBC_OK);
    assert!(stmt > 0);

    let mut out = vec![0u8; 256];
    let mut written: c_uint = 0;
    let exec = dbc_stmt_exec(
        stmt,
        ptr::null(),
        0,
        out.as_mut_ptr(),
        out.len() as c_uint,
        &mut written,
        None,
        ptr::null_mut(),
    );
    assert_eq!(exec, DBC_OK);
    assert_eq!(
        ResultDecoder::parse(&out[..written as usize]).unwrap().row_count(),
        Some(1)
    );

    let more = dbc_stmt_more_results(
        stmt,
        out.as_mut_ptr(),
        out.len() as c_uint,
        &mut written,
        None,
        ptr::null_mut(),
    );
    assert_eq!(more, DBC_OK);
    assert_eq!(
        ResultDecoder::parse(&out[..written as usize]).unwrap().row_count(),
        Some(2)
    );

    dbc_connection_free(conn);
    let after_free = dbc_stmt_exec(
        stmt,
        ptr::null(),
        0,
        out.as_mut_ptr(),
        out.len() as c_uint,
        &mut written,
        None,
        ptr::null_mut(),
    );
    assert_eq!(after_free, DBC_ERROR);
    assert_eq!(dbc_stmt_drop(stmt, None, ptr::null_mut()), DBC_OK);
}

#[test]
fn test_cancel_and_null_arguments() {
    let (_fake, ctx) = fake_driver();
    set_thread_driver(ctx);
    let conn = dbc_connection_new(ptr::null());
    assert_eq!(dbc_cancel(conn), DBC_OK);

    let mut written: c_uint = 0;
    let rc = dbc_exec(
        conn,
        ptr::null(),
        ptr::null(),
        0,
        ptr::null_mut(),
        0,
        &mut written,
        None,
        ptr::null_mut(),
    );
    assert_eq!(rc, DBC_ERROR);

    let mut buf = [0 as std::os::raw::c_char; 64];
    let n = dbc_get_error(conn, buf.as_mut_ptr(), buf.len() as c_uint);
    assert!(n > 0);
    // Safety: null-terminated by dbc_get_error
    let msg = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) }.to_string_lossy();
    assert_eq!(msg, "Code: -2002 Msg: Invalid Arguments");
    dbc_connection_free(conn);
}
