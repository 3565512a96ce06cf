pub mod env;

use dbcapi_engine::test_helpers::FakeClient;
use dbcapi_engine::{Connection, DriverContext, EngineConfig};
use std::sync::Arc;

#[allow(unused_imports)]
pub use env::{real_connection_string, should_run_e2e_tests};

/// Driver context backed by a fresh in-memory client.
#[allow(dead_code)]
pub fn fake_driver() -> (Arc<FakeClient>, Arc<DriverContext>) {
    let fake = Arc::new(FakeClient::new());
    let ctx = DriverContext::with_client(EngineConfig::default(), fake.clone());
    (fake, ctx)
}

/// Connection on `ctx`, connected synchronously.
#[allow(dead_code)]
pub fn connect(ctx: &Arc<DriverContext>) -> Connection {
    let conn = Connection::with_driver(ctx.clone(), vec![]).expect("create connection");
    conn.connect(vec![]).expect("connect");
    conn
}

#[allow(dead_code)]
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
