//! The fixed error taxonomy.
//!
//! Every fallible kernel API and every I/O operation reports one of these
//! codes; the syscall layer passes them to user space as the negated
//! discriminant.

use strum::FromRepr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, thiserror::Error)]
#[repr(isize)]
pub enum AbiError {
    #[error("invalid argument")]
    InvalidArgument = 1,
    #[error("device or resource busy")]
    Busy = 2,
    #[error("operation not supported")]
    NotSupported = 3,
    #[error("no such device")]
    NoDevice = 4,
    #[error("input/output error")]
    Io = 5,
    #[error("bad format")]
    BadFormat = 6,
    #[error("no such file")]
    NotFound = 7,
    #[error("access denied")]
    AccessDenied = 8,
    #[error("bad file descriptor")]
    BadFileDescriptor = 9,
    #[error("too many open files")]
    TooManyOpenFiles = 10,
    #[error("too many processes")]
    TooManyProcesses = 11,
    #[error("too many threads")]
    TooManyThreads = 12,
    #[error("no such child")]
    NoChild = 13,
    #[error("out of memory")]
    OutOfMemory = 14,
    #[error("broken pipe")]
    BrokenPipe = 15,
    #[error("out of data blocks")]
    NoDataBlocks = 16,
    #[error("out of inode blocks")]
    NoInodeBlocks = 17,
}

impl AbiError {
    /// The negative value placed in the return register.
    #[must_use]
    pub const fn code(self) -> isize {
        -(self as isize)
    }

    /// Recovers the error from a negative return value.
    #[must_use]
    pub fn from_code(raw: isize) -> Option<Self> {
        Self::from_repr(-raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_stable() {
        assert_eq!(AbiError::InvalidArgument.code(), -1);
        assert_eq!(AbiError::NoDevice.code(), -4);
        assert_eq!(AbiError::BadFileDescriptor.code(), -9);
        assert_eq!(AbiError::NoInodeBlocks.code(), -17);
    }

    #[test]
    fn from_code_round_trips() {
        for raw in -17..=-1 {
            let e = AbiError::from_code(raw).unwrap();
            assert_eq!(e.code(), raw);
        }
        assert_eq!(AbiError::from_code(0), None);
        assert_eq!(AbiError::from_code(-18), None);
        assert_eq!(AbiError::from_code(3), None);
    }
}
