//! Trap entry, dispatch, and return.
//!
//! Two vectors: `_utrap_entry` is installed while user code runs and finds
//! the kernel stack through the anchor in `sscratch`; `_ktrap_entry` runs
//! on whatever kernel stack is current. Both build a [`TrapFrame`] and
//! call [`trap_dispatch`].
//!
//! Because every address space shares the kernel's global mappings, traps
//! never switch page tables on the way in.

use core::arch::global_asm;

use riscv::{
    interrupt::Trap,
    register::{
        scause, sstatus, stval,
        stvec::{self, Stvec, TrapMode},
    },
};

use crate::{
    interrupt::{plic, timer},
    memory::{
        layout::{UMEM_END, UMEM_START},
        page_down,
        page_table::PteFlags,
        vspace,
    },
    println, proc, syscall, thread,
};

/// Saved machine state, laid out for the assembly stubs.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    /// x1..x31 at their natural indices; `x[0]` is unused.
    pub x: [usize; 32], // 0
    pub sepc: usize,  // 256
    pub sstatus: usize, // 264
}

pub const FRAME_SIZE: usize = size_of::<TrapFrame>();
const _: () = assert!(FRAME_SIZE == 272);

// register-index aliases for the argument registers
pub const REG_SP: usize = 2;
pub const REG_A0: usize = 10;
pub const REG_A1: usize = 11;
pub const REG_A7: usize = 17;

impl TrapFrame {
    /// A frame that enters user mode at `pc` with stack `sp`.
    ///
    /// `sstatus` gets SPP=User, SPIE (interrupts on after `sret`), and SUM
    /// so the kernel keeps reading user buffers directly.
    pub fn new_user(pc: usize, sp: usize) -> Self {
        const SSTATUS_SPIE: usize = 1 << 5;
        const SSTATUS_SUM: usize = 1 << 18;
        let mut sstatus = sstatus::read().bits();
        sstatus &= !(1 << 8); // SPP = User
        sstatus |= SSTATUS_SPIE | SSTATUS_SUM;

        let mut frame = Self {
            x: [0; 32],
            sepc: pc,
            sstatus,
        };
        frame.x[REG_SP] = sp;
        frame
    }
}

global_asm!(
    r#"
    # Trap taken while in user mode. sscratch holds the running thread's
    # stack anchor; the frame goes right below the anchor.
    .align 2
    .globl _utrap_entry
_utrap_entry:
    csrrw sp, sscratch, sp
    addi sp, sp, -{frame_size}
    sd x1, 8(sp)
    sd x3, 24(sp)
    sd x4, 32(sp)
    sd x5, 40(sp)
    sd x6, 48(sp)
    sd x7, 56(sp)
    sd x8, 64(sp)
    sd x9, 72(sp)
    sd x10, 80(sp)
    sd x11, 88(sp)
    sd x12, 96(sp)
    sd x13, 104(sp)
    sd x14, 112(sp)
    sd x15, 120(sp)
    sd x16, 128(sp)
    sd x17, 136(sp)
    sd x18, 144(sp)
    sd x19, 152(sp)
    sd x20, 160(sp)
    sd x21, 168(sp)
    sd x22, 176(sp)
    sd x23, 184(sp)
    sd x24, 192(sp)
    sd x25, 200(sp)
    sd x26, 208(sp)
    sd x27, 216(sp)
    sd x28, 224(sp)
    sd x29, 232(sp)
    sd x30, 240(sp)
    sd x31, 248(sp)
    # the user sp parked in sscratch; zero sscratch to mark kernel mode
    csrrw t0, sscratch, zero
    sd t0, 16(sp)
    csrr t1, sepc
    sd t1, 256(sp)
    csrr t2, sstatus
    sd t2, 264(sp)
    # kernel thread pointer lives in the anchor just above the frame
    ld tp, {frame_size}(sp)
    # nested traps now use the kernel vector
    la t3, _ktrap_entry
    csrw stvec, t3
    mv a0, sp
    call {dispatch}

    # fall through: return to user mode from the frame at sp
    .globl _utrap_return
_utrap_return:
    csrci sstatus, 2
    mv a0, sp
    addi a1, sp, {frame_size}

    # _trap_frame_jump(frame: *TrapFrame, anchor: *StackAnchor) -> !
    # Enters user mode from a constructed frame; also the tail of the
    # normal return path.
    .globl _trap_frame_jump
_trap_frame_jump:
    csrci sstatus, 2
    mv sp, a0
    la t0, _utrap_entry
    csrw stvec, t0
    csrw sscratch, a1
    ld t1, 256(sp)
    csrw sepc, t1
    ld t2, 264(sp)
    csrw sstatus, t2
    ld x1, 8(sp)
    ld x3, 24(sp)
    ld x4, 32(sp)
    ld x5, 40(sp)
    ld x6, 48(sp)
    ld x7, 56(sp)
    ld x8, 64(sp)
    ld x9, 72(sp)
    ld x10, 80(sp)
    ld x11, 88(sp)
    ld x12, 96(sp)
    ld x13, 104(sp)
    ld x14, 112(sp)
    ld x15, 120(sp)
    ld x16, 128(sp)
    ld x17, 136(sp)
    ld x18, 144(sp)
    ld x19, 152(sp)
    ld x20, 160(sp)
    ld x21, 168(sp)
    ld x22, 176(sp)
    ld x23, 184(sp)
    ld x24, 192(sp)
    ld x25, 200(sp)
    ld x26, 208(sp)
    ld x27, 216(sp)
    ld x28, 224(sp)
    ld x29, 232(sp)
    ld x30, 240(sp)
    ld x31, 248(sp)
    ld sp, 16(sp)
    sret

    # Trap taken while already in the kernel: frame on the current stack.
    .align 2
    .globl _ktrap_entry
_ktrap_entry:
    addi sp, sp, -{frame_size}
    sd x1, 8(sp)
    sd x3, 24(sp)
    sd x4, 32(sp)
    sd x5, 40(sp)
    sd x6, 48(sp)
    sd x7, 56(sp)
    sd x8, 64(sp)
    sd x9, 72(sp)
    sd x10, 80(sp)
    sd x11, 88(sp)
    sd x12, 96(sp)
    sd x13, 104(sp)
    sd x14, 112(sp)
    sd x15, 120(sp)
    sd x16, 128(sp)
    sd x17, 136(sp)
    sd x18, 144(sp)
    sd x19, 152(sp)
    sd x20, 160(sp)
    sd x21, 168(sp)
    sd x22, 176(sp)
    sd x23, 184(sp)
    sd x24, 192(sp)
    sd x25, 200(sp)
    sd x26, 208(sp)
    sd x27, 216(sp)
    sd x28, 224(sp)
    sd x29, 232(sp)
    sd x30, 240(sp)
    sd x31, 248(sp)
    addi t0, sp, {frame_size}
    sd t0, 16(sp)
    csrr t1, sepc
    sd t1, 256(sp)
    csrr t2, sstatus
    sd t2, 264(sp)
    mv a0, sp
    call {dispatch}
    ld t1, 256(sp)
    csrw sepc, t1
    ld t2, 264(sp)
    csrw sstatus, t2
    ld x1, 8(sp)
    ld x3, 24(sp)
    ld x4, 32(sp)
    ld x5, 40(sp)
    ld x6, 48(sp)
    ld x7, 56(sp)
    ld x8, 64(sp)
    ld x9, 72(sp)
    ld x10, 80(sp)
    ld x11, 88(sp)
    ld x12, 96(sp)
    ld x13, 104(sp)
    ld x14, 112(sp)
    ld x15, 120(sp)
    ld x16, 128(sp)
    ld x17, 136(sp)
    ld x18, 144(sp)
    ld x19, 152(sp)
    ld x20, 160(sp)
    ld x21, 168(sp)
    ld x22, 176(sp)
    ld x23, 184(sp)
    ld x24, 192(sp)
    ld x25, 200(sp)
    ld x26, 208(sp)
    ld x27, 216(sp)
    ld x28, 224(sp)
    ld x29, 232(sp)
    ld x30, 240(sp)
    ld x31, 248(sp)
    addi sp, sp, {frame_size}
    sret
    "#,
    frame_size = const FRAME_SIZE,
    dispatch = sym trap_dispatch,
);

unsafe extern "C" {
    fn _ktrap_entry();
    /// Enters user mode from `frame`, arming `sscratch` with `anchor`.
    pub fn _trap_frame_jump(frame: *const TrapFrame, anchor: *mut thread::StackAnchor) -> !;
}

/// Points traps at the kernel vector. The user vector is installed on the
/// way out to user mode.
pub fn init() {
    let mut vec = Stvec::from_bits(0);
    vec.set_address(_ktrap_entry as usize);
    vec.set_trap_mode(TrapMode::Direct);
    unsafe {
        stvec::write(vec);
    }
    unsafe {
        sstatus::set_sum();
    }
}

/// Enters user mode at a constructed trap frame. Used by exec and by the
/// fork child, which have never taken a trap.
pub fn trap_frame_jump(frame: &TrapFrame) -> ! {
    unsafe { _trap_frame_jump(frame, thread::current_anchor()) }
}

const SSTATUS_SPP: usize = 1 << 8;

extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    let cause = scause::read();
    match cause.cause() {
        Trap::Interrupt(code) => dispatch_interrupt(code),
        Trap::Exception(code) => dispatch_exception(code, frame),
    }
}

fn dispatch_interrupt(code: usize) {
    const SUPERVISOR_TIMER: usize = 5;
    const SUPERVISOR_EXTERNAL: usize = 9;

    match code {
        SUPERVISOR_TIMER => {
            timer::handle_interrupt();
            // preempt whoever was running when the slice expired
            thread::yield_now();
        }
        SUPERVISOR_EXTERNAL => plic::dispatch(),
        _ => panic!("unexpected interrupt {code}"),
    }
}

fn dispatch_exception(code: usize, frame: &mut TrapFrame) {
    const USER_ECALL: usize = 8;
    const INSTRUCTION_PAGE_FAULT: usize = 12;
    const LOAD_PAGE_FAULT: usize = 13;
    const STORE_PAGE_FAULT: usize = 15;

    let from_user = frame.sstatus & SSTATUS_SPP == 0;
    if !from_user {
        let stval = stval::read();
        panic!(
            "supervisor exception {code} at {:#x}, stval={stval:#x}",
            frame.sepc
        );
    }

    match code {
        USER_ECALL => {
            // resume past the ecall, with the result in a0
            frame.sepc += 4;
            crate::interrupt::enable();
            let ret = syscall::dispatch(frame);
            crate::interrupt::disable();
            frame.x[REG_A0] = ret as usize;
        }
        INSTRUCTION_PAGE_FAULT | LOAD_PAGE_FAULT | STORE_PAGE_FAULT => {
            let addr = stval::read();
            if (UMEM_START..UMEM_END).contains(&addr) {
                demand_map(addr, frame);
            } else {
                fault_exit(code, addr, frame);
            }
        }
        _ => fault_exit(code, stval::read(), frame),
    }
}

/// On-demand zero paging: user page faults inside the user window get a
/// fresh anonymous page.
fn demand_map(addr: usize, frame: &mut TrapFrame) {
    let res = vspace::active_table().alloc_and_map_range(
        page_down(addr),
        1,
        PteFlags::URW,
    );
    if res.is_err() {
        fault_exit(13, addr, frame);
    }
}

/// An unserviceable user fault kills the process.
fn fault_exit(code: usize, addr: usize, frame: &mut TrapFrame) -> ! {
    println!(
        "user fault: cause={code} addr={addr:#x} pc={:#x} thread={}",
        frame.sepc,
        thread::current_name()
    );
    proc::exit_current();
}
