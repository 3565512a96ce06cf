use serde::{Deserialize, Serialize};
use std::fmt;

/// Native client protocol version as negotiated through `init`.
///
/// The client library understands versions 1 through 5; version 2 adds
/// cancel, version 4 adds batched (wide) parameter binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiVersion(pub u32);

impl ApiVersion {
    pub const V1: ApiVersion = ApiVersion(1);
    pub const V2: ApiVersion = ApiVersion(2);
    pub const V3: ApiVersion = ApiVersion(3);
    pub const V4: ApiVersion = ApiVersion(4);
    pub const V5: ApiVersion = ApiVersion(5);

    /// Lowest version the engine can run against.
    pub const MINIMUM: ApiVersion = ApiVersion::V2;

    pub fn supports_wide_binding(&self) -> bool {
        *self >= ApiVersion::V4
    }

    pub fn supports_cancel(&self) -> bool {
        *self >= ApiVersion::V2
    }

    pub fn is_usable(&self) -> bool {
        *self >= ApiVersion::MINIMUM
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        ApiVersion::V4
    }
}
