//! Support for the integration tests: `.env` loading and the in-memory
//! client.

pub use crate::native::fake::{FakeCell, FakeClient, FakeResult};

/// Loads `.env` from the working directory or its parents, once. Missing
/// files are ignored.
pub fn load_dotenv() {
    static LOADED: std::sync::Once = std::sync::Once::new();
    LOADED.call_once(|| {
        if let Err(e) = dotenvy::dotenv() {
            log::debug!("no .env loaded: {}", e);
        }
    });
}
