//! Errors reported by the virtual memory manager.

use core::fmt;

/// Kernel error number for an exhausted resource.
pub const ENOMEM: i32 = 3;
/// Kernel error number for a bad address.
pub const EFAULT: i32 = 6;
/// Kernel error number for an invalid argument.
pub const EINVAL: i32 = 8;

/// Errors reported to the trap layer and to process management.
///
/// Every variant except [`VmError::FatalBootFault`] is recoverable: the caller decides
/// whether to terminate the faulting process. None of them should be retried blindly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// An address-space record, region record, physical frame or page table slot could not
    /// be allocated.
    OutOfMemory,
    /// The caller supplied an argument the subsystem does not understand.
    InvalidArgument,
    /// The faulting address is not covered by a region, or the fault signals a mapping the
    /// subsystem never creates.
    AccessViolation,
    /// A fault arrived before any process or address space existed. Retrying would loop
    /// forever, so the kernel must panic instead.
    FatalBootFault,
}

impl VmError {
    /// Returns the kernel error number for this error.
    pub const fn errno(self) -> i32 {
        match self {
            Self::OutOfMemory => ENOMEM,
            Self::InvalidArgument => EINVAL,
            Self::AccessViolation | Self::FatalBootFault => EFAULT,
        }
    }

    /// Returns true if the error must bring the kernel down.
    pub const fn is_fatal(self) -> bool {
        matches!(self, Self::FatalBootFault)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::AccessViolation => write!(f, "access violation"),
            Self::FatalBootFault => write!(f, "fault with no current address space"),
        }
    }
}

impl core::error::Error for VmError {}

/// Result type used throughout the crate.
pub type VmResult<T> = Result<T, VmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(VmError::OutOfMemory.errno(), ENOMEM);
        assert_eq!(VmError::InvalidArgument.errno(), EINVAL);
        assert_eq!(VmError::AccessViolation.errno(), EFAULT);
        assert_eq!(VmError::FatalBootFault.errno(), EFAULT);
    }

    #[test]
    fn only_boot_faults_are_fatal() {
        assert!(VmError::FatalBootFault.is_fatal());
        assert!(!VmError::AccessViolation.is_fatal());
        assert!(!VmError::OutOfMemory.is_fatal());
    }
}
