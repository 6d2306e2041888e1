//! The ready list and the context-switch path.
//!
//! FIFO scheduling on a single hart. The idle thread is always either
//! running or on the ready list, so picking the head never fails.

use core::ptr;

use crate::{
    interrupt::{self, IrqCell},
    memory::vspace,
    thread::{self, IDLE_TID, State, Thread, context::_thread_swtch},
};

struct ReadyList {
    head: *mut Thread,
    tail: *mut Thread,
}

unsafe impl Send for ReadyList {}

static READY: IrqCell<ReadyList> = IrqCell::new(ReadyList {
    head: ptr::null_mut(),
    tail: ptr::null_mut(),
});

/// Appends a READY thread. Callable from ISR context.
pub(super) fn ready_insert(thread: *mut Thread) {
    READY.with(|list| unsafe {
        debug_assert_eq!((*thread).state, State::Ready);
        (*thread).list_next = ptr::null_mut();
        if list.tail.is_null() {
            list.head = thread;
        } else {
            (*list.tail).list_next = thread;
        }
        list.tail = thread;
    });
}

fn ready_remove() -> *mut Thread {
    READY.with(|list| unsafe {
        let head = list.head;
        assert!(!head.is_null(), "ready list empty (idle thread missing)");
        list.head = (*head).list_next;
        if list.head.is_null() {
            list.tail = ptr::null_mut();
        }
        (*head).list_next = ptr::null_mut();
        head
    })
}

/// Switches to the next ready thread.
///
/// Must be called with interrupts disabled; returns, with interrupts still
/// disabled, when the caller is next scheduled. A caller that is still
/// RUNNING goes back on the ready list; WAITING and EXITED callers stay
/// off it.
pub(super) fn suspend() {
    assert!(!interrupt::is_enabled());

    let me = super::current_ptr();
    unsafe {
        if (*me).state == State::Running {
            (*me).state = State::Ready;
            ready_insert(me);
        }

        let next = ready_remove();
        (*next).state = State::Running;

        // run on the next thread's address space
        let tag = if (*next).proc.is_null() {
            vspace::main_tag()
        } else {
            (*(*next).proc).space
        };
        if tag != vspace::active() {
            vspace::switch(tag);
        }

        if next == me {
            return;
        }

        let prev = _thread_swtch(next);

        // the thread that ran before us may have exited for good; its
        // kernel stack is no longer reachable
        if (*prev).state == State::Exited && (*prev).stack_base != 0 {
            crate::memory::page::free_page((*prev).stack_base);
            (*prev).stack_base = 0;
        }
    }
}

/// Spawns the always-ready idle thread.
pub(super) fn spawn_idle() {
    extern "C" fn idle(_: usize, _: usize, _: usize) {
        loop {
            let ready = READY.with(|list| !list.head.is_null());
            if ready {
                thread::yield_now();
            } else {
                // sleep until any interrupt; checking with interrupts
                // disabled closes the wake-up race
                interrupt::free(|| {
                    if READY.with(|list| list.head.is_null()) {
                        riscv::asm::wfi();
                    }
                });
            }
        }
    }

    let tid = thread::spawn_in_slot("idle", idle, [0; 3], Some(IDLE_TID))
        .expect("spawning the idle thread");
    assert_eq!(tid, IDLE_TID);
}
