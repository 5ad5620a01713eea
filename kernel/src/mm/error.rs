//! Memory Manager Error Types
//!
//! Recoverable failures of cache operations. Invariant violations are not
//! errors; they raise a bug check (see `ke::bugcheck`).

/// Errors returned by cache and backing store operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Backing store or page allocator exhausted
    NoMemory,
    /// A page cannot be discarded right now (wired, mapped or in use)
    Busy,
    /// Offset is outside anything the store can back
    BadAddress,
    /// The backing store does not implement the operation
    NotSupported,
    /// The store has no special fault handling; use the generic path
    NoHandler,
    /// I/O error reported by the backing store
    Io(i32),
    /// Malformed argument
    InvalidParameter,
}

impl VmError {
    /// Human-readable description of the error
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoMemory => "out of memory",
            Self::Busy => "resource busy",
            Self::BadAddress => "bad address",
            Self::NotSupported => "operation not supported",
            Self::NoHandler => "no fault handler",
            Self::Io(_) => "I/O error",
            Self::InvalidParameter => "invalid parameter",
        }
    }
}

impl core::fmt::Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io(code) => write!(f, "{} ({})", self.as_str(), code),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}

/// Result type for memory manager operations
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display() {
        assert_eq!(VmError::Busy.to_string(), "resource busy");
        assert_eq!(VmError::Io(-5).to_string(), "I/O error (-5)");
    }
}
