//! Pipes: a single-page ring buffer behind two one-way endpoints.

use alloc::sync::Arc;

use crate::{
    error::{KernelError, Result},
    interrupt::{self, IrqCell},
    io::{Io, IoOps},
    memory::{PAGE_SIZE, page},
    thread::Condition,
};

const PIPE_BUFSZ: usize = PAGE_SIZE;

struct PipeState {
    /// The ring page. Head and tail are free-running; their difference is
    /// the fill level.
    buf: *mut u8,
    head: usize,
    tail: usize,
    reader_closed: bool,
    writer_closed: bool,
}

unsafe impl Send for PipeState {}

struct PipeShared {
    state: IrqCell<PipeState>,
    readable: Condition,
    writable: Condition,
}

impl Drop for PipeShared {
    fn drop(&mut self) {
        // both endpoints are gone; the ring page goes back to the pool
        self.state.with(|s| unsafe {
            page::free_page(s.buf as usize);
        });
    }
}

/// Creates a pipe: `(reader, writer)`.
pub fn create_pipe() -> Result<(Io, Io)> {
    let buf = page::alloc_page().ok_or(KernelError::OutOfMemory)?;
    let shared = Arc::new(PipeShared {
        state: IrqCell::new(PipeState {
            buf: buf.as_ptr(),
            head: 0,
            tail: 0,
            reader_closed: false,
            writer_closed: false,
        }),
        readable: Condition::new("pipe.readable"),
        writable: Condition::new("pipe.writable"),
    });
    let reader = Io::new(PipeReader {
        shared: shared.clone(),
    });
    let writer = Io::new(PipeWriter { shared });
    Ok((reader, writer))
}

struct PipeReader {
    shared: Arc<PipeShared>,
}

struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl IoOps for PipeReader {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let shared = &*self.shared;
        // the state check and the wait must be one atomic step, or a
        // broadcast between them is lost
        let n = interrupt::free(|| loop {
            let s = unsafe { shared.state.get_mut_unchecked() };
            if s.head != s.tail {
                let n = buf.len().min(s.tail - s.head);
                for slot in buf[..n].iter_mut() {
                    *slot = unsafe { *s.buf.add(s.head % PIPE_BUFSZ) };
                    s.head += 1;
                }
                break n;
            }
            if s.writer_closed {
                break 0; // drained and no writer left: end of stream
            }
            unsafe {
                shared.readable.wait_disabled();
            }
        });
        if n > 0 {
            shared.writable.broadcast();
        }
        Ok(n)
    }

    fn close(&self) {
        self.shared.state.with(|s| s.reader_closed = true);
        self.shared.readable.broadcast();
        self.shared.writable.broadcast();
    }
}

impl IoOps for PipeWriter {
    fn write(&self, buf: &[u8]) -> Result<usize> {
        let shared = &*self.shared;
        let mut done = 0;
        while done < buf.len() {
            let wrote = interrupt::free(|| loop {
                let s = unsafe { shared.state.get_mut_unchecked() };
                if s.reader_closed {
                    break Err(KernelError::BrokenPipe);
                }
                let space = PIPE_BUFSZ - (s.tail - s.head);
                if space == 0 {
                    unsafe {
                        shared.writable.wait_disabled();
                    }
                    continue;
                }
                let n = (buf.len() - done).min(space);
                for &byte in &buf[done..done + n] {
                    unsafe {
                        *s.buf.add(s.tail % PIPE_BUFSZ) = byte;
                    }
                    s.tail += 1;
                }
                break Ok(n);
            })?;
            done += wrote;
            shared.readable.broadcast();
        }
        Ok(done)
    }

    fn close(&self) {
        self.shared.state.with(|s| s.writer_closed = true);
        self.shared.readable.broadcast();
        self.shared.writable.broadcast();
    }
}
