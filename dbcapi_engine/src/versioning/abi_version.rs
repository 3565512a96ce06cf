use std::fmt;

/// Version of the C ABI exported from `ffi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbiVersion {
    pub major: u16,
    pub minor: u16,
}

impl AbiVersion {
    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn current() -> Self {
        Self::new(1, 0)
    }

    pub fn is_compatible_with(&self, other: &AbiVersion) -> bool {
        self.major == other.major && self.minor >= other.minor
    }

    /// Packs the version as `major << 16 | minor` for the C side.
    pub fn packed(&self) -> u32 {
        ((self.major as u32) << 16) | self.minor as u32
    }
}

impl fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for AbiVersion {
    fn default() -> Self {
        Self::current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abi_version_current() {
        assert_eq!(AbiVersion::current(), AbiVersion::new(1, 0));
    }

    #[test]
    fn test_abi_version_compatibility() {
        let v = AbiVersion::new(1, 2);
        assert!(v.is_compatible_with(&AbiVersion::new(1, 0)));
        assert!(!v.is_compatible_with(&AbiVersion::new(2, 0)));
        assert!(!AbiVersion::new(1, 0).is_compatible_with(&v));
    }

    #[test]
    fn test_abi_version_packed() {
        assert_eq!(AbiVersion::new(1, 3).packed(), 0x0001_0003);
    }

    #[test]
    fn test_abi_version_display() {
        assert_eq!(AbiVersion::new(1, 0).to_string(), "1.0");
    }
}
