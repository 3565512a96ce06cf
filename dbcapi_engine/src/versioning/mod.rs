pub mod abi_version;
pub mod api_version;

pub use abi_version::AbiVersion;
pub use api_version::ApiVersion;
