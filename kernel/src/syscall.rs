//! The system-call layer: decode, validate, dispatch.
//!
//! Arguments arrive in `a0..a3`, the call number in `a7`, and the result
//! goes back in `a0` as a non-negative value or a negated error code.
//!
//! User pointers are used directly (the SUM bit stays set); the layer
//! checks ranges against the user window and demand-maps any page the
//! kernel is about to touch on the process's behalf, so a syscall never
//! takes a supervisor page fault.

use alloc::vec::Vec;

use ktos_abi::{AbiError, IoctlCmd, SyscallNum, encode_ret};

use crate::{
    device,
    error::{KernelError, Result},
    fs,
    interrupt::{
        timer,
        trap::{REG_A0, REG_A7, TrapFrame},
    },
    io::{IoCtl, pipe},
    memory::{
        PAGE_SIZE,
        layout::{UMEM_END, UMEM_START},
        page_down,
        page_table::PteFlags,
        vspace,
    },
    println, proc, thread,
};

/// Longest NUL-terminated string a syscall accepts.
const MAX_STR: usize = 256;
/// An argv whose pointer table alone would fill the stack page cannot be
/// passed through exec.
const MAX_ARGS: usize = PAGE_SIZE / size_of::<usize>();

pub fn dispatch(frame: &mut TrapFrame) -> isize {
    let num = frame.x[REG_A7];
    let a: [usize; 4] = frame.x[REG_A0..REG_A0 + 4].try_into().unwrap();

    let Some(code) = SyscallNum::from_repr(num) else {
        log::warn!("unknown syscall {num} from {}", thread::current_name());
        return AbiError::NotSupported.code();
    };

    let res = match code {
        SyscallNum::Exit => proc::exit_current(),
        SyscallNum::Exec => sys_exec(a[0] as isize, a[1], a[2]),
        SyscallNum::Fork => proc::fork(frame),
        SyscallNum::Wait => sys_wait(a[0] as isize),
        SyscallNum::Print => sys_print(a[0]),
        SyscallNum::Usleep => {
            timer::sleep_us(a[0] as u64);
            Ok(0)
        }
        SyscallNum::Devopen => sys_devopen(a[0] as isize, a[1], a[2]),
        SyscallNum::Fsopen => sys_fsopen(a[0] as isize, a[1]),
        SyscallNum::Fscreate => user_cstr(a[0]).and_then(|name| fs::create(&name).map(|()| 0)),
        SyscallNum::Fsdelete => user_cstr(a[0]).and_then(|name| fs::delete(&name).map(|()| 0)),
        SyscallNum::Close => proc::current().close_fd(a[0]).map(|()| 0),
        SyscallNum::Read => sys_read(a[0], a[1], a[2] as isize),
        SyscallNum::Write => sys_write(a[0], a[1], a[2] as isize),
        SyscallNum::Ioctl => sys_ioctl(a[0], a[1] as i32, a[2]),
        SyscallNum::Pipe => sys_pipe(a[0], a[1]),
        SyscallNum::Iodup => sys_iodup(a[0] as isize, a[1] as isize),
    };

    encode_ret(res.map_err(AbiError::from))
}

// user-memory access

/// Checks that `[addr, addr + len)` lies inside the user window and that
/// every page of it is mapped, demand-mapping fresh zero pages as needed.
fn require_user_range(addr: usize, len: usize) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let end = addr.checked_add(len).ok_or(KernelError::InvalidArgument)?;
    if addr < UMEM_START || end > UMEM_END {
        return Err(KernelError::InvalidArgument);
    }
    let mut table = vspace::active_table();
    let mut page = page_down(addr);
    while page < end {
        if table.translate(page).is_none() {
            table.alloc_and_map_range(page, 1, PteFlags::URW)?;
        }
        page += PAGE_SIZE;
    }
    Ok(())
}

/// A mutable view of user memory, valid for the rest of the syscall.
fn user_slice_mut(addr: usize, len: usize) -> Result<&'static mut [u8]> {
    require_user_range(addr, len)?;
    Ok(unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, len) })
}

fn user_slice(addr: usize, len: usize) -> Result<&'static [u8]> {
    require_user_range(addr, len)?;
    Ok(unsafe { core::slice::from_raw_parts(addr as *const u8, len) })
}

/// Copies a NUL-terminated user string into the kernel.
fn user_cstr(addr: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for i in 0..MAX_STR {
        require_user_range(addr + i, 1)?;
        let byte = unsafe { *(addr as *const u8).add(i) };
        if byte == 0 {
            return Ok(out);
        }
        out.push(byte);
    }
    Err(KernelError::InvalidArgument)
}

fn user_u64(addr: usize) -> Result<u64> {
    let bytes = user_slice(addr, size_of::<u64>())?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

fn write_user_u64(addr: usize, value: u64) -> Result<()> {
    user_slice_mut(addr, size_of::<u64>())?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

// handlers

fn sys_wait(tid: isize) -> Result<usize> {
    if tid < 0 {
        return Err(KernelError::InvalidArgument);
    }
    thread::join(tid as usize)
}

fn sys_print(msg: usize) -> Result<usize> {
    let msg = user_cstr(msg)?;
    let name = thread::current_name();
    let text = core::str::from_utf8(&msg).map_err(|_| KernelError::InvalidArgument)?;
    println!("Thread <{}:{}> says: {}", name, thread::current(), text);
    Ok(0)
}

fn sys_exec(fd: isize, argc: usize, argv: usize) -> Result<usize> {
    if fd < 0 {
        return Err(KernelError::BadFileDescriptor);
    }
    if argc >= MAX_ARGS {
        return Err(KernelError::OutOfMemory);
    }
    let exe = proc::current().fd_get(fd as usize)?.addref();

    // copy argv into kernel memory before the old image goes away
    let mut args: Vec<Vec<u8>> = Vec::with_capacity(argc);
    let ptrs = user_slice(argv, argc * size_of::<usize>())?;
    for chunk in ptrs.chunks_exact(size_of::<usize>()) {
        let ptr = usize::from_le_bytes(chunk.try_into().unwrap());
        args.push(user_cstr(ptr)?);
    }

    match proc::exec::exec(exe, args) {
        Ok(never) => match never {},
        Err(e) => Err(e),
    }
}

fn sys_devopen(fd: isize, name: usize, instance: usize) -> Result<usize> {
    let name = user_cstr(name)?;
    let name = core::str::from_utf8(&name).map_err(|_| KernelError::InvalidArgument)?;
    let io = device::open(name, instance)?;
    proc::current().install(fd_pref(fd)?, io)
}

fn sys_fsopen(fd: isize, name: usize) -> Result<usize> {
    let name = user_cstr(name)?;
    let io = fs::open(&name)?;
    proc::current().install(fd_pref(fd)?, io)
}

/// A negative descriptor argument means "pick the lowest free slot".
fn fd_pref(fd: isize) -> Result<Option<usize>> {
    if fd < 0 {
        Ok(None)
    } else if (fd as usize) < crate::param::PROCESS_IOMAX {
        Ok(Some(fd as usize))
    } else {
        Err(KernelError::BadFileDescriptor)
    }
}

fn sys_read(fd: usize, buf: usize, len: isize) -> Result<usize> {
    if len < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let io = proc::current().fd_get(fd)?.addref();
    let buf = user_slice_mut(buf, len as usize)?;
    io.read(buf)
}

fn sys_write(fd: usize, buf: usize, len: isize) -> Result<usize> {
    if len < 0 {
        return Err(KernelError::InvalidArgument);
    }
    let io = proc::current().fd_get(fd)?.addref();
    let buf = user_slice(buf, len as usize)?;
    io.write_all(buf)
}

fn sys_ioctl(fd: usize, cmd: i32, arg: usize) -> Result<usize> {
    let io = proc::current().fd_get(fd)?.addref();
    let cmd = IoctlCmd::from_repr(cmd).ok_or(KernelError::NotSupported)?;
    match cmd {
        IoctlCmd::GetBlkSz => io.cntl(IoCtl::GetBlkSz),
        IoctlCmd::GetEnd => {
            let mut end = 0;
            io.cntl(IoCtl::GetEnd(&mut end))?;
            write_user_u64(arg, end)?;
            Ok(0)
        }
        IoctlCmd::SetEnd => io.cntl(IoCtl::SetEnd(user_u64(arg)?)),
        IoctlCmd::GetPos => {
            let mut pos = 0;
            io.cntl(IoCtl::GetPos(&mut pos))?;
            write_user_u64(arg, pos)?;
            Ok(0)
        }
        IoctlCmd::SetPos => io.cntl(IoCtl::SetPos(user_u64(arg)?)),
    }
}

/// `pipe(wfdptr, rfdptr)`: negative requested slots mean "next free".
fn sys_pipe(wfd_ptr: usize, rfd_ptr: usize) -> Result<usize> {
    let wfd_req = user_u64(wfd_ptr)? as i64;
    let rfd_req = user_u64(rfd_ptr)? as i64;

    let (reader, writer) = pipe::create_pipe()?;
    let p = proc::current();
    let wfd = p.install(fd_pref(wfd_req as isize)?, writer)?;
    let rfd = match p.install(fd_pref(rfd_req as isize)?, reader) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = p.close_fd(wfd);
            return Err(e);
        }
    };

    write_user_u64(wfd_ptr, wfd as u64)?;
    write_user_u64(rfd_ptr, rfd as u64)?;
    Ok(0)
}

fn sys_iodup(old_fd: isize, new_fd: isize) -> Result<usize> {
    if old_fd < 0 {
        return Err(KernelError::BadFileDescriptor);
    }
    let new_fd = fd_pref(new_fd)?;
    // an occupied target closes first, dup2-style
    if let Some(fd) = new_fd {
        let p = proc::current();
        if p.fd_get(fd).is_ok() {
            p.close_fd(fd)?;
        }
    }
    proc::current().dup(old_fd as usize, new_fd)?;
    Ok(0)
}
