//! The kernel/user contract: syscall numbers, ioctl codes, and the error
//! taxonomy.
//!
//! Everything here is shared verbatim between the kernel's syscall layer and
//! the user-space runtime. Kernel APIs report failure as a negative value
//! from [`AbiError`]; non-negative values are success (usually a count).

#![cfg_attr(not(test), no_std)]

use strum::FromRepr;

pub mod error;

pub use self::error::AbiError;

/// System call numbers, as found in register `a7` at the `ecall`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(usize)]
pub enum SyscallNum {
    Exit = 0,
    Exec = 1,
    Fork = 2,
    Wait = 3,
    Print = 4,
    Usleep = 5,
    Devopen = 10,
    Fsopen = 11,
    Fscreate = 12,
    Fsdelete = 13,
    Close = 16,
    Read = 17,
    Write = 18,
    Ioctl = 19,
    Pipe = 20,
    Iodup = 21,
}

/// I/O control commands understood by [`SyscallNum::Ioctl`] and by the
/// in-kernel `Io::cntl` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(i32)]
pub enum IoctlCmd {
    /// Returns the endpoint's block size. No argument.
    GetBlkSz = 0,
    /// Stores the end position (length) into the `u64` the argument points to.
    GetEnd = 2,
    /// Sets the end position from the `u64` the argument points to.
    SetEnd = 3,
    /// Stores the current position into the `u64` the argument points to.
    GetPos = 4,
    /// Sets the current position from the `u64` the argument points to.
    SetPos = 5,
}

/// Size of a process's I/O descriptor table.
pub const PROCESS_IOMAX: usize = 16;

/// Result alias used on both sides of the ABI boundary.
pub type Result<T> = core::result::Result<T, AbiError>;

/// Folds a syscall result into the single register returned to user mode.
///
/// Success values must be representable as a non-negative `isize`.
#[must_use]
pub fn encode_ret(res: Result<usize>) -> isize {
    match res {
        Ok(n) => isize::try_from(n).expect("syscall success value out of range"),
        Err(e) => e.code(),
    }
}

/// Splits the raw register returned by `ecall` back into a result.
pub fn decode_ret(raw: isize) -> Result<usize> {
    if raw < 0 {
        Err(AbiError::from_code(raw).unwrap_or(AbiError::Io))
    } else {
        Ok(raw as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_numbers_match_contract() {
        assert_eq!(SyscallNum::from_repr(0), Some(SyscallNum::Exit));
        assert_eq!(SyscallNum::from_repr(5), Some(SyscallNum::Usleep));
        assert_eq!(SyscallNum::from_repr(10), Some(SyscallNum::Devopen));
        assert_eq!(SyscallNum::from_repr(21), Some(SyscallNum::Iodup));
        // holes between the process group and the I/O group stay holes
        assert_eq!(SyscallNum::from_repr(6), None);
        assert_eq!(SyscallNum::from_repr(14), None);
        assert_eq!(SyscallNum::from_repr(15), None);
        assert_eq!(SyscallNum::from_repr(22), None);
    }

    #[test]
    fn ret_round_trip() {
        assert_eq!(decode_ret(encode_ret(Ok(42))), Ok(42));
        assert_eq!(
            decode_ret(encode_ret(Err(AbiError::BadFileDescriptor))),
            Err(AbiError::BadFileDescriptor)
        );
    }
}
