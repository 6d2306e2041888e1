//! Positioned I/O over an in-memory byte buffer.

use alloc::vec::Vec;

use mutex_api::Mutex as _;

use crate::{
    error::{KernelError, Result},
    io::{Io, IoCtl, IoOps},
    thread::KMutex,
};

struct MemState {
    buf: Vec<u8>,
    /// Logical end; SETEND may only move it down.
    end: usize,
}

pub struct MemIo {
    state: KMutex<MemState>,
}

/// Wraps `data` in an endpoint. The buffer's length is the initial end.
pub fn create_memory_io(data: Vec<u8>) -> Io {
    let end = data.len();
    Io::new(MemIo {
        state: KMutex::new(MemState { buf: data, end }),
    })
}

impl IoOps for MemIo {
    fn readat(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let state = self.state.lock();
        let Ok(pos) = usize::try_from(pos) else {
            return Ok(0);
        };
        if pos >= state.end {
            return Ok(0); // out-of-range reads truncate to nothing
        }
        let n = buf.len().min(state.end - pos);
        buf[..n].copy_from_slice(&state.buf[pos..pos + n]);
        Ok(n)
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        let pos = usize::try_from(pos).map_err(|_| KernelError::InvalidArgument)?;
        if pos >= state.end {
            return Err(KernelError::InvalidArgument);
        }
        let n = buf.len().min(state.end - pos);
        state.buf[pos..pos + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn cntl(&self, op: IoCtl) -> Result<usize> {
        match op {
            IoCtl::GetBlkSz => Ok(1),
            IoCtl::GetEnd(out) => {
                *out = self.state.lock().end as u64;
                Ok(0)
            }
            IoCtl::SetEnd(new_end) => {
                let mut state = self.state.lock();
                let new_end = usize::try_from(new_end).map_err(|_| KernelError::InvalidArgument)?;
                if new_end > state.end {
                    return Err(KernelError::InvalidArgument); // grow is not possible
                }
                state.end = new_end;
                Ok(0)
            }
            _ => Err(KernelError::NotSupported),
        }
    }
}
