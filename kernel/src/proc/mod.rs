//! Processes: a table slot, an address space, and a descriptor table.

use core::ptr;

use alloc::boxed::Box;

use crate::{
    error::{KernelError, Result},
    interrupt::{self, IrqCell, trap::TrapFrame},
    io::Io,
    memory::vspace,
    param::{NPROC, PROCESS_IOMAX},
    println,
    thread::{self, Condition, Tid},
};

pub mod exec;

pub struct Process {
    pub idx: usize,
    /// Thread that owns this process.
    pub tid: Tid,
    /// Address-space tag installed while the owner runs.
    pub space: usize,
    iotab: [Option<Io>; PROCESS_IOMAX],
}

impl Process {
    fn new(idx: usize, tid: Tid, space: usize) -> Box<Self> {
        Box::new(Self {
            idx,
            tid,
            space,
            iotab: [const { None }; PROCESS_IOMAX],
        })
    }

    /// The endpoint behind descriptor `fd`.
    pub fn fd_get(&self, fd: usize) -> Result<&Io> {
        self.iotab
            .get(fd)
            .and_then(|slot| slot.as_ref())
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Installs `io` at `fd` (replacing nothing), or at the lowest free
    /// slot when `fd` is `None`. Returns the descriptor used.
    pub fn install(&mut self, fd: Option<usize>, io: Io) -> Result<usize> {
        let fd = match fd {
            Some(fd) => {
                let slot = self
                    .iotab
                    .get(fd)
                    .ok_or(KernelError::BadFileDescriptor)?;
                if slot.is_some() {
                    return Err(KernelError::BadFileDescriptor);
                }
                fd
            }
            None => self
                .iotab
                .iter()
                .position(|slot| slot.is_none())
                .ok_or(KernelError::TooManyOpenFiles)?,
        };
        self.iotab[fd] = Some(io);
        Ok(fd)
    }

    /// Duplicates `old_fd` into `new_fd` (closing what was there), or into
    /// the lowest free slot.
    pub fn dup(&mut self, old_fd: usize, new_fd: Option<usize>) -> Result<usize> {
        let io = self.fd_get(old_fd)?.addref();
        match new_fd {
            Some(fd) => {
                let slot = self
                    .iotab
                    .get_mut(fd)
                    .ok_or(KernelError::BadFileDescriptor)?;
                *slot = Some(io);
                Ok(fd)
            }
            None => self.install(None, io),
        }
    }

    /// Closes descriptor `fd`.
    pub fn close_fd(&mut self, fd: usize) -> Result<()> {
        let slot = self
            .iotab
            .get_mut(fd)
            .ok_or(KernelError::BadFileDescriptor)?;
        slot.take().ok_or(KernelError::BadFileDescriptor)?.close();
        Ok(())
    }
}

struct ProcTable([*mut Process; NPROC]);

unsafe impl Send for ProcTable {}

static PROCS: IrqCell<ProcTable> = IrqCell::new(ProcTable([ptr::null_mut(); NPROC]));

/// Creates the main process around the main thread.
pub fn init() {
    let main = Box::into_raw(Process::new(0, thread::MAIN_TID, vspace::main_tag()));
    PROCS.with(|t| t.0[0] = main);
    thread::set_current_process(main);
    log::info!("proc: table ready, {NPROC} slots");
}

/// The calling thread's process. Panics for pure kernel threads.
pub fn current() -> &'static mut Process {
    let p = thread::current_process().expect("no process on this thread");
    unsafe { &mut *p.as_ptr() }
}

/// Forks the current process.
///
/// The child gets a deep copy of the user address space, a duplicate of
/// every open descriptor, and a fresh thread that resumes from a copy of
/// `frame` with a zero return value. The parent blocks until the child
/// has taken its copy, then returns the child's thread id.
pub fn fork(frame: &TrapFrame) -> Result<usize> {
    let parent = current();

    let slot = PROCS.with(|t| t.0.iter().position(|p| p.is_null()))
        .ok_or(KernelError::TooManyProcesses)?;

    let child_tag = vspace::clone_active()?;

    let mut child = Process::new(slot, 0, child_tag);
    for (theirs, ours) in child.iotab.iter_mut().zip(parent.iotab.iter()) {
        *theirs = ours.as_ref().map(Io::addref);
    }
    let child = Box::into_raw(child);

    // handshake: the child must finish copying the trap frame before the
    // parent can return to user mode and clobber it
    let done = ForkDone {
        flag: IrqCell::new(false),
        cond: Condition::new("fork.done"),
    };

    let tid = match thread::spawn(
        "forkchild",
        fork_child_entry,
        [
            child as usize,
            ptr::from_ref(frame).addr(),
            ptr::from_ref(&done).addr(),
        ],
    ) {
        Ok(tid) => tid,
        Err(e) => {
            drop(unsafe { Box::from_raw(child) });
            vspace::discard(child_tag);
            return Err(e);
        }
    };

    unsafe {
        (*child).tid = tid;
    }
    PROCS.with(|t| t.0[slot] = child);

    interrupt::free(|| unsafe {
        while !*done.flag.get_mut_unchecked() {
            done.cond.wait_disabled();
        }
    });

    Ok(tid)
}

struct ForkDone {
    flag: IrqCell<bool>,
    cond: Condition,
}

extern "C" fn fork_child_entry(proc_ptr: usize, frame_ptr: usize, done_ptr: usize) {
    // copy the parent's trap frame onto this thread's own stack before
    // letting the parent go
    let frame = {
        let mut frame = unsafe { *(frame_ptr as *const TrapFrame) };
        frame.x[crate::interrupt::trap::REG_A0] = 0; // fork returns 0 here
        frame
    };

    let proc = proc_ptr as *mut Process;
    thread::set_current_process(proc);
    vspace::switch(unsafe { (*proc).space });

    let done = done_ptr as *const ForkDone;
    unsafe {
        (*done).flag.with(|f| *f = true);
        (*done).cond.broadcast();
    }

    crate::interrupt::trap::trap_frame_jump(&frame);
}

/// Tears the current process down and terminates its thread.
pub fn exit_current() -> ! {
    let p = current();

    for slot in p.iotab.iter_mut() {
        if let Some(io) = slot.take() {
            io.close();
        }
    }

    thread::set_current_process(ptr::null_mut());
    vspace::discard_active();
    crate::memory::page::assert_conserved();
    log::debug!(
        "proc: slot {} exiting, {} pages free",
        p.idx,
        crate::memory::page::free_count()
    );

    let idx = p.idx;
    PROCS.with(|t| t.0[idx] = ptr::null_mut());
    drop(unsafe { Box::from_raw(p as *mut Process) });

    thread::exit();
}

/// An init image baked into the kernel, used when the filesystem has no
/// `init`. Empty unless the `init-image` feature supplies one.
#[cfg(feature = "init-image")]
static INIT_IMAGE: &[u8] = include_bytes!(env!("KTOS_INIT_IMAGE"));
#[cfg(not(feature = "init-image"))]
static INIT_IMAGE: &[u8] = &[];

/// Opens the initial program and becomes it.
pub fn run_init() -> ! {
    const INIT: &str = "init";
    let io = crate::fs::open(INIT.as_bytes()).or_else(|e| {
        if INIT_IMAGE.is_empty() {
            Err(e)
        } else {
            log::warn!("fs has no {INIT}, using the embedded image");
            let mem = crate::io::memio::create_memory_io(INIT_IMAGE.to_vec());
            crate::io::seekio::create_seekable_io(mem)
        }
    });
    let io = match io {
        Ok(io) => io,
        Err(e) => panic!("cannot open {INIT}: {e}"),
    };
    println!("running {INIT}");
    match exec::exec(io, alloc::vec![INIT.as_bytes().to_vec()]) {
        Ok(never) => match never {},
        Err(e) => panic!("exec {INIT}: {e}"),
    }
}
