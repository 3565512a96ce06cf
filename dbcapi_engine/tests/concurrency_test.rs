//! Concurrency: per-connection serialization, cancel from the controlling
//! thread, and teardown racing with in-flight work.
mod helpers;
use dbcapi_engine::async_bridge::WorkDispatcher;
use dbcapi_engine::{Arg, DbError, Outcome, QueryResult, Value};
use helpers::{connect, fake_driver, init_logging};
use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

type Seen = Rc<RefCell<Vec<(Option<DbError>, Outcome)>>>;

fn recorder(seen: &Seen) -> Arg {
    let s = seen.clone();
    Arg::callback(move |err, out| s.borrow_mut().push((err, out)))
}

#[test]
fn test_back_to_back_async_execs_never_overlap() {
    init_logging();
    let (fake, ctx) = fake_driver();
    fake.set_call_delay(Duration::from_millis(2));
    let conn = connect(&ctx);
    let seen: Seen = Rc::new(RefCell::new(Vec::new()));

    for i in 0..8 {
        conn.exec(vec![
            Arg::string("SELECT ? AS n"),
            Arg::Array(vec![Arg::Number(i as f64)]),
            recorder(&seen),
        ])
        .unwrap();
    }
    conn.dispatcher().wait_idle();

    assert!(!fake.overlap_detected());
    let seen = seen.borrow();
    assert_eq!(seen.len(), 8);
    let mut values: Vec<i32> = seen
        .iter()
        .map(|(err, out)| {
            assert!(err.is_none());
            match out {
                Outcome::Result(QueryResult::Rows(rows)) => {
                    rows[0].get("n").and_then(Value::as_i32).unwrap()
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        })
        .collect();
    values.sort_unstable();
    assert_eq!(values, (0..8).collect::<Vec<_>>());
}

#[test]
fn test_mixed_operations_on_one_connection_are_serialized() {
    let (fake, ctx) = fake_driver();
    fake.set_call_delay(Duration::from_millis(1));
    let conn = connect(&ctx);
    let seen: Seen = Rc::new(RefCell::new(Vec::new()));

    conn.prepare(vec![Arg::string("SELECT ? AS v"), recorder(&seen)])
        .unwrap();
    conn.exec(vec![Arg::string("UPDATE t SET x = 1"), recorder(&seen)])
        .unwrap();
    conn.commit(vec![recorder(&seen)]).unwrap();
    conn.rollback(vec![recorder(&seen)]).unwrap();
    conn.dispatcher().wait_idle();

    assert!(!fake.overlap_detected());
    assert_eq!(seen.borrow().len(), 4);
    assert!(seen.borrow().iter().all(|(err, _)| err.is_none()));
}

#[test]
fn test_separate_connections_run_independently() {
    let (fake, ctx) = fake_driver();
    fake.set_call_delay(Duration::from_millis(5));
    let a = connect(&ctx);
    let b = connect(&ctx);
    let seen: Seen = Rc::new(RefCell::new(Vec::new()));

    for _ in 0..3 {
        a.exec(vec![Arg::string("SELECT 1"), recorder(&seen)]).unwrap();
        b.exec(vec![Arg::string("SELECT 2"), recorder(&seen)]).unwrap();
    }
    a.dispatcher().wait_idle();

    assert!(!fake.overlap_detected());
    assert_eq!(seen.borrow().len(), 6);
}

#[test]
fn test_cancel_reaches_native_while_exec_in_flight() {
    let (fake, ctx) = fake_driver();
    fake.set_call_delay(Duration::from_millis(100));
    let conn = connect(&ctx);
    let seen: Seen = Rc::new(RefCell::new(Vec::new()));

    conn.exec(vec![Arg::string("SELECT 1"), recorder(&seen)])
        .unwrap();
    thread::sleep(Duration::from_millis(20));
    conn.cancel().unwrap();
    assert_eq!(fake.cancel_calls(), 1);

    conn.dispatcher().wait_idle();
    assert_eq!(seen.borrow().len(), 1);
}

#[test]
fn test_disconnect_queued_behind_exec() {
    let (fake, ctx) = fake_driver();
    fake.set_call_delay(Duration::from_millis(5));
    let conn = connect(&ctx);
    let stmt = conn
        .prepare(vec![Arg::string("SELECT ? AS v")])
        .unwrap()
        .into_statement()
        .unwrap();
    let seen: Seen = Rc::new(RefCell::new(Vec::new()));

    stmt.exec(vec![Arg::Array(vec![Arg::Number(1.0)]), recorder(&seen)])
        .unwrap();
    conn.disconnect(vec![recorder(&seen)]).unwrap();
    conn.dispatcher().wait_idle();

    assert!(!fake.overlap_detected());
    assert_eq!(fake.live_statements(), 0);
    assert_eq!(ctx.open_connections(), 0);
    assert!(seen.borrow().iter().any(|(err, _)| err.is_none()));
    assert_eq!(stmt.exec(vec![]).unwrap_err(), DbError::InvalidObject);
}

#[test]
fn test_dropping_connection_with_work_in_flight() {
    let (fake, ctx) = fake_driver();
    fake.set_call_delay(Duration::from_millis(20));
    let conn = connect(&ctx);
    let seen: Seen = Rc::new(RefCell::new(Vec::new()));

    conn.exec(vec![Arg::string("SELECT 1"), recorder(&seen)])
        .unwrap();
    drop(conn);

    WorkDispatcher::current(ctx.config().worker_threads).wait_idle();
    assert_eq!(seen.borrow().len(), 1);
    assert!(seen.borrow()[0].0.is_none());
    assert_eq!(ctx.open_connections(), 0);
    assert_eq!(fake.live_connections(), 0);
}

#[test]
fn test_connections_on_other_threads() {
    let (fake, ctx) = fake_driver();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let ctx = ctx.clone();
            thread::spawn(move || {
                let conn = connect(&ctx);
                let out = conn
                    .exec(vec![
                        Arg::string("SELECT ? AS id"),
                        Arg::Array(vec![Arg::Number(i as f64)]),
                    ])
                    .unwrap()
                    .into_result()
                    .unwrap();
                assert_eq!(out.rows().unwrap()[0].get("id"), Some(&Value::Integer(i)));
            })
        })
        .collect();

    for h in handles {
        h.join().expect("thread join");
    }
    assert_eq!(ctx.open_connections(), 0);
    assert_eq!(fake.fini_calls(), fake.init_calls());
}
