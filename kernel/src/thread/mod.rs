//! Threads, condition variables, and recursive locks.
//!
//! Threads are slots in a fixed table, identified by index. The running
//! thread is whatever `tp` points at. All list manipulation happens inside
//! interrupts-disabled sections; conditions may be broadcast from ISR
//! context and never yield there.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
};

use alloc::boxed::Box;
use arrayvec::ArrayString;

use crate::{
    error::{KernelError, Result},
    interrupt::{self, IrqCell},
    memory::{PAGE_SIZE, page},
    param::{NTHR, TIME_SLICE_MS},
    proc::Process,
    start::{BOOT_STACK, BOOT_STACK_SIZE},
};

pub mod context;
pub mod scheduler;

pub use self::context::{Context, StackAnchor};

pub type Tid = usize;

pub const MAIN_TID: Tid = 0;
pub const IDLE_TID: Tid = NTHR - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Ready,
    Running,
    Waiting,
    Exited,
}

pub struct Thread {
    /// Must be first: the switch assembly addresses it at `0(tp)`.
    pub(super) ctx: Context,
    id: Tid,
    name: ArrayString<16>,
    state: State,
    /// Top-of-stack anchor, also the initial kernel stack pointer.
    stack_anchor: *mut StackAnchor,
    /// Stack page to free after exit; 0 for the boot stack.
    stack_base: usize,
    parent: Option<Tid>,
    /// Intrusive link for the ready list or a condition's wait list.
    list_next: *mut Thread,
    /// Condition this thread is waiting on, if any.
    wait_cond: *const Condition,
    /// Broadcast when this thread exits.
    child_exit: Condition,
    /// Chain of locks this thread currently owns.
    lock_list: *mut Lock,
    /// Owning process; null for pure kernel threads.
    proc: *mut Process,
}

/// The thread table. Entries are heap-allocated and live until reclaimed
/// by `join`.
struct Table([*mut Thread; NTHR]);

unsafe impl Send for Table {}

static THREADS: IrqCell<Table> = IrqCell::new(Table([ptr::null_mut(); NTHR]));

// current-thread access via the thread-pointer register

fn current_ptr() -> *mut Thread {
    let tp: usize;
    unsafe {
        core::arch::asm!("mv {}, tp", out(reg) tp);
    }
    tp as *mut Thread
}

unsafe fn install_current(thread: *mut Thread) {
    unsafe {
        core::arch::asm!("mv tp, {}", in(reg) thread);
    }
}

/// Id of the running thread.
pub fn current() -> Tid {
    unsafe { (*current_ptr()).id }
}

/// Name of the running thread.
pub fn current_name() -> ArrayString<16> {
    unsafe { (*current_ptr()).name }
}

/// The running thread's process, if it has one.
pub fn current_process() -> Option<NonNull<Process>> {
    NonNull::new(unsafe { (*current_ptr()).proc })
}

/// Binds the running thread to a process.
pub fn set_current_process(proc: *mut Process) {
    unsafe {
        (*current_ptr()).proc = proc;
    }
}

/// The running thread's kernel stack anchor, for `sscratch`.
pub fn current_anchor() -> *mut StackAnchor {
    unsafe { (*current_ptr()).stack_anchor }
}

impl Thread {
    fn new(id: Tid, name: &str, parent: Option<Tid>) -> Box<Self> {
        let mut thread = Box::new(Self {
            ctx: Context::zeroed(),
            id,
            name: ArrayString::new(),
            state: State::Uninitialized,
            stack_anchor: ptr::null_mut(),
            stack_base: 0,
            parent,
            list_next: ptr::null_mut(),
            wait_cond: ptr::null(),
            child_exit: Condition::new("child_exit"),
            lock_list: ptr::null_mut(),
            proc: ptr::null_mut(),
        });
        let _ = thread.name.try_push_str(name);
        thread
    }

    /// Carves the anchor out of the top of a stack region.
    fn set_stack(&mut self, base: usize, size: usize) {
        let anchor = (base + size - size_of::<StackAnchor>()) as *mut StackAnchor;
        unsafe {
            (*anchor).thread = self;
            (*anchor).reserved = 0;
        }
        self.stack_anchor = anchor;
        self.stack_base = base;
    }
}

/// Sets up the main thread (the caller) and the idle thread.
pub fn init() {
    let mut main = Thread::new(MAIN_TID, "main", None);
    main.state = State::Running;
    let base = (&raw const BOOT_STACK) as usize;
    main.set_stack(base, BOOT_STACK_SIZE);
    main.stack_base = 0; // boot stack is static, never freed
    let main = Box::into_raw(main);

    THREADS.with(|t| t.0[MAIN_TID] = main);
    unsafe {
        install_current(main);
    }

    scheduler::spawn_idle();
    log::info!("thread: table ready, {NTHR} slots");
}

/// Creates a thread running `entry(args[0], args[1], args[2])` and makes
/// it runnable. Returns its id.
pub fn spawn(
    name: &str,
    entry: extern "C" fn(usize, usize, usize),
    args: [usize; 3],
) -> Result<Tid> {
    spawn_in_slot(name, entry, args, None)
}

/// Like [`spawn`], but into a caller-chosen table slot.
pub(super) fn spawn_in_slot(
    name: &str,
    entry: extern "C" fn(usize, usize, usize),
    args: [usize; 3],
    slot: Option<Tid>,
) -> Result<Tid> {
    let parent = current();
    let stack = page::alloc_page().ok_or(KernelError::OutOfMemory)?;

    THREADS.with(|t| {
        let free = match slot {
            Some(id) if t.0[id].is_null() => Some(id),
            Some(_) => None,
            // the last slot is reserved for the idle thread
            None => t.0[..NTHR - 1].iter().position(|p| p.is_null()),
        };
        let Some(id) = free else {
            unsafe {
                page::free_page(stack.addr().get());
            }
            return Err(KernelError::TooManyThreads);
        };

        let mut thread = Thread::new(id, name, Some(parent));
        thread.set_stack(stack.addr().get(), PAGE_SIZE);
        thread.ctx.s[0] = args[0];
        thread.ctx.s[1] = args[1];
        thread.ctx.s[2] = args[2];
        thread.ctx.s[8] = entry as usize;
        thread.ctx.ra = context::_thread_startup as usize;
        thread.ctx.sp = thread.stack_anchor as usize;
        thread.state = State::Ready;

        let thread = Box::into_raw(thread);
        t.0[id] = thread;
        scheduler::ready_insert(thread);
        Ok(id)
    })
}

/// Gives up the CPU for one scheduling round.
pub fn yield_now() {
    interrupt::free(scheduler::suspend);
}

/// Terminates the running thread. The main thread exiting halts the
/// machine.
pub extern "C" fn exit() -> ! {
    let me = current_ptr();
    unsafe {
        if (*me).id == MAIN_TID {
            crate::device::shutdown();
        }

        interrupt::disable();

        // force-release everything we still hold so no waiter dangles
        let mut lock = (*me).lock_list;
        while !lock.is_null() {
            let next = {
                let inner = (*lock).inner.get_mut_unchecked();
                let next = inner.next;
                inner.owner = ptr::null_mut();
                inner.count = 0;
                inner.next = ptr::null_mut();
                next
            };
            (*lock).waiters.broadcast();
            lock = next;
        }
        (*me).lock_list = ptr::null_mut();

        // orphans go to the grandparent
        let my_id = (*me).id;
        let grandparent = (*me).parent;
        THREADS.with(|t| {
            for &p in t.0.iter() {
                if !p.is_null() && (*p).parent == Some(my_id) {
                    (*p).parent = grandparent;
                }
            }
        });

        (*me).state = State::Exited;
        (*me).child_exit.broadcast();
        scheduler::suspend();
    }
    unreachable!("exited thread resumed");
}

/// Waits for a child to exit and reclaims it.
///
/// With `tid == 0`, any child of the caller is picked. Returns the child's
/// id, or `EINVAL` when the target does not exist or is not a child.
pub fn join(tid: Tid) -> Result<Tid> {
    let me = current();

    let target = THREADS.with(|t| {
        if tid == 0 {
            t.0.iter()
                .find(|&&p| !p.is_null() && unsafe { (*p).parent } == Some(me))
                .map(|&p| p)
                .ok_or(KernelError::InvalidArgument)
        } else {
            let p = *t.0.get(tid).ok_or(KernelError::InvalidArgument)?;
            if p.is_null() || unsafe { (*p).parent } != Some(me) {
                return Err(KernelError::InvalidArgument);
            }
            Ok(p)
        }
    })?;

    let id = unsafe { (*target).id };
    loop {
        let exited = interrupt::free(|| unsafe {
            if (*target).state == State::Exited {
                true
            } else {
                (*target).child_exit.wait_disabled();
                false
            }
        });
        if exited {
            break;
        }
    }

    // reclaim: orphans go to their grandparent (the caller)
    THREADS.with(|t| {
        for &p in t.0.iter() {
            if !p.is_null() && unsafe { (*p).parent } == Some(id) {
                unsafe {
                    (*p).parent = Some(me);
                }
            }
        }
        t.0[id] = ptr::null_mut();
    });
    unsafe {
        // the switch path frees the stack of an exited predecessor, but
        // not when the successor was a brand-new thread; catch up here
        if (*target).stack_base != 0 {
            page::free_page((*target).stack_base);
        }
        drop(Box::from_raw(target));
    }
    Ok(id)
}

/// Spawns the kernel thread that keeps a short alarm pending, so the timer
/// keeps firing and the scheduler preempts compute-bound user code.
pub fn spawn_interrupter() {
    extern "C" fn interrupter(_: usize, _: usize, _: usize) {
        loop {
            crate::interrupt::timer::sleep_ms(TIME_SLICE_MS);
        }
    }
    spawn("interrupter", interrupter, [0; 3]).expect("spawning the interrupter");
}

// CONDITION VARIABLES

struct WaitList {
    head: *mut Thread,
    tail: *mut Thread,
}

unsafe impl Send for WaitList {}

/// A named wait list. All wakeups are broadcasts; waiters re-check their
/// predicate.
pub struct Condition {
    name: &'static str,
    wait: IrqCell<WaitList>,
}

impl Condition {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            wait: IrqCell::new(WaitList {
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
            }),
        }
    }

    /// Suspends the caller until the next broadcast.
    ///
    /// # Safety
    ///
    /// Interrupts must be disabled, so that the caller's predicate check
    /// and the wait are one atomic step. They stay disabled on return, but
    /// are enabled while other threads run in between.
    pub unsafe fn wait_disabled(&self) {
        let me = current_ptr();
        unsafe {
            assert_eq!(
                (*me).state,
                State::Running,
                "wait on {} by a non-running thread",
                self.name
            );
            (*me).state = State::Waiting;
            (*me).wait_cond = self;
            (*me).list_next = ptr::null_mut();

            let list = self.wait.get_mut_unchecked();
            if list.tail.is_null() {
                list.head = me;
            } else {
                (*list.tail).list_next = me;
            }
            list.tail = me;
        }
        scheduler::suspend();
    }

    /// Moves every waiter to the ready list. Never yields, so it is legal
    /// from ISR context.
    pub fn broadcast(&self) {
        self.wait.with(|list| {
            let mut t = list.head;
            list.head = ptr::null_mut();
            list.tail = ptr::null_mut();
            while !t.is_null() {
                unsafe {
                    let next = (*t).list_next;
                    (*t).list_next = ptr::null_mut();
                    (*t).wait_cond = ptr::null();
                    (*t).state = State::Ready;
                    scheduler::ready_insert(t);
                    t = next;
                }
            }
        });
    }
}

// RECURSIVE LOCKS

struct LockInner {
    owner: *mut Thread,
    count: usize,
    /// Link in the owner's held-locks chain.
    next: *mut Lock,
}

unsafe impl Send for LockInner {}

/// A recursive mutex with ownership tracking.
///
/// Re-acquisition by the owner nests; releases by non-owners are no-ops;
/// everything a thread still holds is force-released when it exits.
pub struct Lock {
    inner: IrqCell<LockInner>,
    waiters: Condition,
}

impl Lock {
    pub const fn new() -> Self {
        Self {
            inner: IrqCell::new(LockInner {
                owner: ptr::null_mut(),
                count: 0,
                next: ptr::null_mut(),
            }),
            waiters: Condition::new("lock.waiters"),
        }
    }

    /// Takes the lock only if nobody holds it. Unlike [`Lock::acquire`],
    /// this does not nest: an owner retrying gets `false`.
    pub fn try_acquire(&self) -> bool {
        let me = current_ptr();
        self.inner.with(|inner| {
            if !inner.owner.is_null() {
                return false;
            }
            inner.owner = me;
            inner.count = 1;
            unsafe {
                inner.next = (*me).lock_list;
                (*me).lock_list = self as *const Self as *mut Self;
            }
            true
        })
    }

    pub fn acquire(&self) {
        interrupt::free(|| unsafe {
            while !self.take_if_free() {
                self.waiters.wait_disabled();
            }
        });
    }

    /// # Safety
    ///
    /// Interrupts must be disabled.
    unsafe fn take_if_free(&self) -> bool {
        let me = current_ptr();
        unsafe {
            let inner = self.inner.get_mut_unchecked();
            if inner.owner == me {
                inner.count += 1;
                return true;
            }
            if inner.owner.is_null() {
                inner.owner = me;
                inner.count = 1;
                inner.next = (*me).lock_list;
                (*me).lock_list = self as *const Self as *mut Self;
                return true;
            }
            false
        }
    }

    pub fn release(&self) {
        let me = current_ptr();
        interrupt::free(|| unsafe {
            let inner = self.inner.get_mut_unchecked();
            if inner.owner != me {
                return; // not ours: no-op by contract
            }
            inner.count -= 1;
            if inner.count > 0 {
                return;
            }
            inner.owner = ptr::null_mut();

            // unlink from our held-locks chain
            let this = self as *const Self as *mut Self;
            let mut cursor = &mut (*me).lock_list;
            while !(*cursor).is_null() {
                if *cursor == this {
                    *cursor = inner.next;
                    break;
                }
                cursor = &mut (*(*cursor)).inner.get_mut_unchecked().next;
            }
            inner.next = ptr::null_mut();

            self.waiters.broadcast();
        });
    }

    /// Whether the caller owns the lock.
    pub fn holding(&self) -> bool {
        let me = current_ptr();
        self.inner.with(|inner| inner.owner == me)
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

// SLEEP MUTEX: `mutex_api` over `Lock`, for the shared filesystem engine

pub struct KMutex<T> {
    lock: Lock,
    value: UnsafeCell<T>,
}

unsafe impl<T> Sync for KMutex<T> where T: Send {}

impl<T> mutex_api::Mutex for KMutex<T> {
    type Data = T;
    type Guard<'a>
        = KMutexGuard<'a, T>
    where
        T: 'a;

    fn new(value: T) -> Self {
        Self {
            lock: Lock::new(),
            value: UnsafeCell::new(value),
        }
    }

    fn lock(&self) -> KMutexGuard<'_, T> {
        self.lock.acquire();
        KMutexGuard { mutex: self }
    }

    fn try_lock(&self) -> Option<KMutexGuard<'_, T>> {
        self.lock.try_acquire().then_some(KMutexGuard { mutex: self })
    }
}

pub struct KMutexGuard<'a, T> {
    mutex: &'a KMutex<T>,
}

impl<T> Drop for KMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.release();
    }
}

impl<T> Deref for KMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for KMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

/// The lock family handed to [`ktfs`].
pub struct KMutexFamily;

impl mutex_api::MutexFamily for KMutexFamily {
    type Mutex<T> = KMutex<T>;
}
