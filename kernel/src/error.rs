//! Kernel-internal errors and their mapping onto the ABI taxonomy.

use ktfs::KtfsError;
use ktos_abi::AbiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("resource busy")]
    Busy,
    #[error("operation not supported")]
    NotSupported,
    #[error("no such device")]
    NoDevice,
    #[error("i/o error")]
    Io,
    #[error("bad format")]
    BadFormat,
    #[error("not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("process table full")]
    TooManyProcesses,
    #[error("thread table full")]
    TooManyThreads,
    #[error("out of memory")]
    OutOfMemory,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("out of data blocks")]
    NoDataBlocks,
    #[error("out of inode blocks")]
    NoInodeBlocks,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl From<KernelError> for AbiError {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::InvalidArgument => Self::InvalidArgument,
            KernelError::Busy => Self::Busy,
            KernelError::NotSupported => Self::NotSupported,
            KernelError::NoDevice => Self::NoDevice,
            KernelError::Io => Self::Io,
            KernelError::BadFormat => Self::BadFormat,
            KernelError::NotFound => Self::NotFound,
            KernelError::AccessDenied => Self::AccessDenied,
            KernelError::BadFileDescriptor => Self::BadFileDescriptor,
            KernelError::TooManyOpenFiles => Self::TooManyOpenFiles,
            KernelError::TooManyProcesses => Self::TooManyProcesses,
            KernelError::TooManyThreads => Self::TooManyThreads,
            KernelError::OutOfMemory => Self::OutOfMemory,
            KernelError::BrokenPipe => Self::BrokenPipe,
            KernelError::NoDataBlocks => Self::NoDataBlocks,
            KernelError::NoInodeBlocks => Self::NoInodeBlocks,
        }
    }
}

impl From<KtfsError> for KernelError {
    fn from(e: KtfsError) -> Self {
        match e {
            KtfsError::InvalidArgument | KtfsError::FileTooLarge | KtfsError::AlreadyExists => {
                Self::InvalidArgument
            }
            KtfsError::OutOfRange => Self::AccessDenied,
            KtfsError::NotFound => Self::NotFound,
            // "already open", a stale handle, and a full directory all
            // surface as the file-table error
            KtfsError::AlreadyOpen | KtfsError::DirectoryFull | KtfsError::BadHandle => {
                Self::TooManyOpenFiles
            }
            KtfsError::NoDataBlocks => Self::NoDataBlocks,
            KtfsError::NoInodeBlocks => Self::NoInodeBlocks,
            KtfsError::BadFormat => Self::BadFormat,
            KtfsError::Disk => Self::Io,
        }
    }
}
