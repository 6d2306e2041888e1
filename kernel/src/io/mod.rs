//! The unified I/O object model.
//!
//! An endpoint implements whatever subset of [`IoOps`] makes sense for its
//! backing; everything else reports `ENOTSUP`. [`Io`] is a reference-
//! counted handle: duplicating a descriptor clones it, and the
//! endpoint's `close` runs when the last handle drops.

use alloc::sync::Arc;

use crate::error::{KernelError, Result};

pub mod memio;
pub mod pipe;
pub mod seekio;

/// Typed control operations, decoded from the ioctl ABI by the syscall
/// layer.
pub enum IoCtl<'a> {
    /// Block size of the endpoint; the result is the size itself.
    GetBlkSz,
    GetEnd(&'a mut u64),
    SetEnd(u64),
    GetPos(&'a mut u64),
    SetPos(u64),
}

/// Operations an endpoint may implement. Unimplemented operations return
/// `ENOTSUP`; `GETBLKSZ` defaults to a byte-granular endpoint.
pub trait IoOps: Send + Sync {
    fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn readat(&self, _pos: u64, _buf: &mut [u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn writeat(&self, _pos: u64, _buf: &[u8]) -> Result<usize> {
        Err(KernelError::NotSupported)
    }

    fn cntl(&self, op: IoCtl) -> Result<usize> {
        match op {
            IoCtl::GetBlkSz => Ok(1),
            _ => Err(KernelError::NotSupported),
        }
    }

    /// Runs when the last handle is closed.
    fn close(&self) {}
}

struct IoInner {
    ops: alloc::boxed::Box<dyn IoOps>,
}

impl Drop for IoInner {
    fn drop(&mut self) {
        self.ops.close();
    }
}

/// A counted handle to an endpoint.
#[derive(Clone)]
pub struct Io(Arc<IoInner>);

impl Io {
    pub fn new(ops: impl IoOps + 'static) -> Self {
        Self(Arc::new(IoInner {
            ops: alloc::boxed::Box::new(ops),
        }))
    }

    /// Another handle to the same endpoint.
    #[must_use]
    pub fn addref(&self) -> Self {
        self.clone()
    }

    /// Drops this handle; the endpoint closes with the last one.
    pub fn close(self) {}

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.0.ops.read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.0.ops.write(buf)
    }

    pub fn readat(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.0.ops.readat(pos, buf)
    }

    pub fn writeat(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        self.0.ops.writeat(pos, buf)
    }

    pub fn cntl(&self, op: IoCtl) -> Result<usize> {
        self.0.ops.cntl(op)
    }

    /// The endpoint's block size.
    pub fn blksz(&self) -> usize {
        self.cntl(IoCtl::GetBlkSz).unwrap_or(1)
    }

    /// Reads until `buf` is full or the endpoint reports end-of-input.
    pub fn fill(&self, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.read(&mut buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    /// Writes all of `buf`, looping over short writes.
    pub fn write_all(&self, buf: &[u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let n = self.write(&buf[done..])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }
}
