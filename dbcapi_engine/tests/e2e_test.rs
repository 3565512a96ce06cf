//! End-to-end tests against a real SQL Anywhere server.
//!
//! Needs the DBCAPI client library and `SQLANY_TEST_CONN` (directly or in
//! `.env`), e.g. `UID=dba;PWD=sql;Host=localhost:2638;DBN=demo`.
mod helpers;
use dbcapi_engine::{Arg, Connection, QueryResult, Value};
use helpers::{init_logging, real_connection_string, should_run_e2e_tests};
use serial_test::serial;

fn open() -> Option<Connection> {
    init_logging();
    if !should_run_e2e_tests() {
        eprintln!("Skipping: SQLANY_TEST_CONN not set");
        return None;
    }
    let conn_str = real_connection_string()?;
    let conn = Connection::new(vec![Arg::string(conn_str)]).expect("create connection");
    conn.connect(vec![]).expect("connect");
    Some(conn)
}

#[test]
#[ignore]
#[serial]
fn test_e2e_select_and_params() {
    let Some(conn) = open() else {
        return;
    };
    let result = conn
        .exec(vec![
            Arg::string("SELECT ? AS n, ? AS s, CAST(NULL AS INT) AS z"),
            Arg::Array(vec![Arg::Number(42.0), Arg::string("hello")]),
        ])
        .expect("exec")
        .into_result()
        .expect("result");
    let row = &result.rows().expect("rows")[0];
    assert_eq!(row.get("n").and_then(Value::as_i32), Some(42));
    assert_eq!(row.get("s").and_then(Value::as_str), Some("hello"));
    assert_eq!(row.get("z"), Some(&Value::Null));
    conn.disconnect(vec![]).expect("disconnect");
}

#[test]
#[ignore]
#[serial]
fn test_e2e_wide_insert_and_transaction() {
    let Some(conn) = open() else {
        return;
    };
    conn.exec(vec![Arg::string(
        "CREATE LOCAL TEMPORARY TABLE e2e_wide (id INT, name VARCHAR(20)) NOT TRANSACTIONAL",
    )])
    .expect("create");

    let stmt = conn
        .prepare(vec![Arg::string("INSERT INTO e2e_wide VALUES (?, ?)")])
        .expect("prepare")
        .into_statement()
        .expect("statement");
    let rows: Vec<Arg> = (0..3)
        .map(|i| Arg::Array(vec![Arg::Number(i as f64), Arg::string(format!("r{}", i))]))
        .collect();
    let inserted = stmt
        .exec(vec![Arg::Array(rows)])
        .expect("wide insert")
        .into_result();
    assert_eq!(inserted, Some(QueryResult::RowCount(3)));
    conn.commit(vec![]).expect("commit");

    let count = conn
        .exec(vec![Arg::string("SELECT COUNT(*) AS c FROM e2e_wide")])
        .expect("count")
        .into_result()
        .expect("result");
    assert_eq!(count.rows().expect("rows")[0].get("c"), Some(&Value::Integer(3)));

    stmt.drop_statement(vec![]).expect("drop");
    conn.disconnect(vec![]).expect("disconnect");
}

#[test]
#[ignore]
#[serial]
fn test_e2e_async_exec() {
    let Some(conn) = open() else {
        return;
    };
    let seen = std::rc::Rc::new(std::cell::RefCell::new(None));
    let s = seen.clone();
    conn.exec(vec![
        Arg::string("SELECT 1 AS one"),
        Arg::callback(move |err, out| *s.borrow_mut() = Some((err, out.into_result()))),
    ])
    .expect("submit");
    conn.dispatcher().wait_idle();
    let (err, result) = seen.borrow_mut().take().expect("callback ran");
    assert!(err.is_none(), "unexpected error: {:?}", err);
    assert_eq!(
        result.expect("result").rows().expect("rows")[0].get("one"),
        Some(&Value::Integer(1))
    );
}
