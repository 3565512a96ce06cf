//! Helper functions for reading environment variables in tests

use dbcapi_engine::test_helpers::load_dotenv;

#[allow(dead_code)]
pub const TEST_CONN_ENV: &str = "SQLANY_TEST_CONN";

/// Connection string of a reachable SQL Anywhere server, from
/// `SQLANY_TEST_CONN` (or `.env`). None when unset; tests skip then.
#[allow(dead_code)]
pub fn real_connection_string() -> Option<String> {
    load_dotenv();
    std::env::var(TEST_CONN_ENV)
        .ok()
        .filter(|s| !s.trim().is_empty())
}

#[allow(dead_code)]
pub fn should_run_e2e_tests() -> bool {
    real_connection_string().is_some()
}
