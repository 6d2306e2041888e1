//! The seekable wrapper: a position over a positionless backing endpoint.
//!
//! Byte-stream `read`/`write` calls become `readat`/`writeat` at the
//! current position, in whole multiples of the backing's block size.

use mutex_api::Mutex as _;

use crate::{
    error::{KernelError, Result},
    io::{Io, IoCtl, IoOps},
    thread::KMutex,
};

struct SeekState {
    pos: u64,
    end: u64,
}

pub struct SeekIo {
    backing: Io,
    /// Power of two, fixed at creation.
    blksz: u64,
    state: KMutex<SeekState>,
}

/// Wraps `backing`, which must answer `GETBLKSZ` (a power of two) and
/// `GETEND`.
pub fn create_seekable_io(backing: Io) -> Result<Io> {
    let blksz = backing.blksz() as u64;
    assert!(blksz.is_power_of_two());
    let mut end = 0;
    backing.cntl(IoCtl::GetEnd(&mut end))?;
    Ok(Io::new(SeekIo {
        backing,
        blksz,
        state: KMutex::new(SeekState { pos: 0, end }),
    }))
}

impl IoOps for SeekIo {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let (pos, len) = {
            let state = self.state.lock();
            let remaining = state.end - state.pos;
            let len = (buf.len() as u64).min(remaining);
            if len == 0 {
                return Ok(0);
            }
            if len < self.blksz {
                return Err(KernelError::InvalidArgument);
            }
            (state.pos, len & !(self.blksz - 1))
        };

        let n = self.backing.readat(pos, &mut buf[..len as usize])?;
        self.state.lock().pos = pos + n as u64;
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len() as u64;
        if len < self.blksz {
            return Err(KernelError::InvalidArgument);
        }
        let len = len & !(self.blksz - 1);

        let pos = {
            let mut state = self.state.lock();
            // writing past the end grows the backing first
            if state.end - state.pos < len {
                let end = state.pos + len;
                self.backing.cntl(IoCtl::SetEnd(end))?;
                state.end = end;
            }
            state.pos
        };

        let n = self.backing.writeat(pos, &buf[..len as usize])?;
        self.state.lock().pos = pos + n as u64;
        Ok(n)
    }

    fn readat(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.backing.readat(pos, buf)
    }

    fn writeat(&self, pos: u64, buf: &[u8]) -> Result<usize> {
        self.backing.writeat(pos, buf)
    }

    fn cntl(&self, op: IoCtl) -> Result<usize> {
        match op {
            IoCtl::GetBlkSz => Ok(self.blksz as usize),
            IoCtl::GetPos(out) => {
                *out = self.state.lock().pos;
                Ok(0)
            }
            IoCtl::SetPos(pos) => {
                let mut state = self.state.lock();
                if pos & (self.blksz - 1) != 0 || pos > state.end {
                    return Err(KernelError::InvalidArgument);
                }
                state.pos = pos;
                Ok(0)
            }
            IoCtl::GetEnd(out) => {
                *out = self.state.lock().end;
                Ok(0)
            }
            IoCtl::SetEnd(end) => {
                let mut state = self.state.lock();
                self.backing.cntl(IoCtl::SetEnd(end))?;
                state.end = end;
                Ok(0)
            }
        }
    }
}
