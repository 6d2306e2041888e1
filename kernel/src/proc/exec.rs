//! exec: replace the current process image.
//!
//! The new image is built in a fresh address space while the old one keeps
//! running, so every failure unwinds to an intact process. Only after the
//! load succeeds does the process switch over and the old space get freed.

use core::convert::Infallible;

use alloc::vec::Vec;

use xmas_elf::{
    ElfFile,
    header::{Class, Data, Machine},
    program::Type,
};

use crate::{
    error::{KernelError, Result},
    interrupt::trap::{self, REG_A0, REG_A1, TrapFrame},
    io::{Io, IoCtl},
    memory::{
        PAGE_SIZE, layout::{UMEM_END, UMEM_START}, page_down, page_table::PteFlags, vspace,
    },
    proc,
};

/// Loads `exeio` and jumps into it. Returns only on failure.
///
/// Takes its arguments by value: the jump at the end never returns, so
/// everything heap-owned must be dropped here first.
pub fn exec(exeio: Io, args: Vec<Vec<u8>>) -> Result<Infallible> {
    // the whole argument block must fit on the stack page
    if args.len() >= PAGE_SIZE / size_of::<usize>() {
        return Err(KernelError::OutOfMemory);
    }
    let argc = args.len();

    let mut end = 0;
    exeio.cntl(IoCtl::GetEnd(&mut end))?;
    let mut image = alloc::vec![0_u8; end as usize];
    exeio.cntl(IoCtl::SetPos(0))?;
    if exeio.fill(&mut image)? != image.len() {
        return Err(KernelError::Io);
    }

    let elf = ElfFile::new(&image).map_err(|_| KernelError::BadFormat)?;
    validate(&elf)?;

    let new_tag = vspace::new_user_space()?;
    let arg_refs: Vec<&[u8]> = args.iter().map(Vec::as_slice).collect();
    let (entry, sp, argv) = match load(&elf, new_tag, &arg_refs) {
        Ok(parts) => parts,
        Err(e) => {
            vspace::discard(new_tag);
            return Err(e);
        }
    };
    drop(arg_refs);
    drop(elf);
    drop(image);
    drop(args);
    exeio.close();

    // point of no return: adopt the new space, drop the old one
    let old_tag = vspace::active();
    proc::current().space = new_tag;
    vspace::switch(new_tag);
    if old_tag != vspace::main_tag() {
        vspace::discard(old_tag);
    }

    let mut frame = TrapFrame::new_user(entry, sp);
    frame.x[REG_A0] = argc;
    frame.x[REG_A1] = argv;
    trap::trap_frame_jump(&frame)
}

fn validate(elf: &ElfFile) -> Result<()> {
    let pt1 = &elf.header.pt1;
    if pt1.class() != Class::SixtyFour || pt1.data() != Data::LittleEndian {
        return Err(KernelError::BadFormat);
    }
    if elf.header.pt2.machine().as_machine() != Machine::RISC_V {
        return Err(KernelError::BadFormat);
    }
    let entry = elf.header.pt2.entry_point() as usize;
    if !(UMEM_START..UMEM_END).contains(&entry) {
        return Err(KernelError::BadFormat);
    }
    Ok(())
}

/// Maps the LOAD segments and the stack into the space behind `tag`.
///
/// Returns the entry point, the initial user stack pointer, and the user
/// address of the argv array.
fn load(elf: &ElfFile, tag: usize, args: &[&[u8]]) -> Result<(usize, usize, usize)> {
    let mut pt = vspace::table(tag);
    let stack_base = UMEM_END - PAGE_SIZE;

    for ph in elf.program_iter() {
        if ph.get_type() != Ok(Type::Load) {
            continue;
        }
        let vaddr = ph.virtual_addr() as usize;
        let memsz = ph.mem_size() as usize;
        let filesz = ph.file_size() as usize;
        let offset = ph.offset() as usize;
        if memsz == 0 {
            continue;
        }
        if vaddr < UMEM_START || vaddr.saturating_add(memsz) > stack_base {
            return Err(KernelError::BadFormat);
        }

        // map writable, copy the file bytes (pages come zeroed, which
        // covers bss), then drop to the segment's own permissions
        let base = page_down(vaddr);
        let span = vaddr + memsz - base;
        let pma = pt.alloc_and_map_range(base, span, PteFlags::URW)?;
        unsafe {
            let dst = (pma + (vaddr - base)) as *mut u8;
            core::ptr::copy_nonoverlapping(elf.input[offset..].as_ptr(), dst, filesz);
        }

        let flags = ph.flags();
        let mut perm = PteFlags::U;
        if flags.is_read() {
            perm |= PteFlags::R;
        }
        if flags.is_write() {
            perm |= PteFlags::W;
        }
        if flags.is_execute() {
            perm |= PteFlags::X;
        }
        pt.set_range_flags(base, span, perm)?;
    }

    // one stack page at the very top of user memory, with the argument
    // block built at its top: the argv array, then the strings
    let stack_pma = pt.alloc_and_map_range(stack_base, PAGE_SIZE, PteFlags::URW)?;

    let table_len = (args.len() + 1) * size_of::<usize>();
    let strings_len: usize = args.iter().map(|a| a.len() + 1).sum();
    let block_len = (table_len + strings_len).next_multiple_of(16);
    let user_block = UMEM_END - block_len;
    let phys_block = stack_pma + PAGE_SIZE - block_len;

    unsafe {
        let table = phys_block as *mut usize;
        let mut str_user = user_block + table_len;
        let mut str_phys = (phys_block + table_len) as *mut u8;
        for (i, arg) in args.iter().enumerate() {
            table.add(i).write(str_user);
            core::ptr::copy_nonoverlapping(arg.as_ptr(), str_phys, arg.len());
            str_phys.add(arg.len()).write(0);
            str_phys = str_phys.add(arg.len() + 1);
            str_user += arg.len() + 1;
        }
        table.add(args.len()).write(0);
    }

    let entry = elf.header.pt2.entry_point() as usize;
    Ok((entry, user_block, user_block))
}
