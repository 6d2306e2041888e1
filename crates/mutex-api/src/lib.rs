//! A minimal mutex abstraction.
//!
//! Subsystems that must run both inside the kernel (under sleep-locks built
//! on condition variables) and on the host (under `std::sync::Mutex`, for
//! tests and the `mkfs` tool) are written against this trait instead of a
//! concrete lock type.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

use core::ops::{Deref, DerefMut};

/// A lock protecting a value of type `Data`.
pub trait Mutex {
    type Data;
    type Guard<'a>: Deref<Target = Self::Data> + DerefMut
    where
        Self: 'a;

    fn new(data: Self::Data) -> Self;

    /// Blocks until the lock is held.
    fn lock(&self) -> Self::Guard<'_>;

    /// Takes the lock only if it is free right now.
    ///
    /// Used by eviction paths that must not wait on a busy resource.
    fn try_lock(&self) -> Option<Self::Guard<'_>>;
}

/// A family of mutexes, one per protected type.
///
/// Generic containers that need several locks of different `Data` types
/// (e.g. a cache with a table lock plus per-entry locks) take one family
/// parameter instead of a parameter per lock.
pub trait MutexFamily {
    type Mutex<T>: Mutex<Data = T>;
}

#[cfg(any(test, feature = "std"))]
mod std_impl {
    use super::{Mutex, MutexFamily};

    /// `std::sync::Mutex` behind the [`Mutex`] trait, for host-side users.
    ///
    /// Poisoning is treated as a bug: a panicked holder panics everyone.
    #[derive(Debug, Default)]
    pub struct StdMutex<T>(std::sync::Mutex<T>);

    impl<T> Mutex for StdMutex<T> {
        type Data = T;
        type Guard<'a>
            = std::sync::MutexGuard<'a, T>
        where
            T: 'a;

        fn new(data: T) -> Self {
            Self(std::sync::Mutex::new(data))
        }

        fn lock(&self) -> Self::Guard<'_> {
            self.0.lock().unwrap()
        }

        fn try_lock(&self) -> Option<Self::Guard<'_>> {
            match self.0.try_lock() {
                Ok(guard) => Some(guard),
                Err(std::sync::TryLockError::WouldBlock) => None,
                Err(std::sync::TryLockError::Poisoned(e)) => panic!("poisoned lock: {e}"),
            }
        }
    }

    /// The [`MutexFamily`] of [`StdMutex`].
    #[derive(Debug, Default)]
    pub struct StdMutexFamily;

    impl MutexFamily for StdMutexFamily {
        type Mutex<T> = StdMutex<T>;
    }
}

#[cfg(any(test, feature = "std"))]
pub use std_impl::{StdMutex, StdMutexFamily};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_try_lock() {
        let m = StdMutex::new(7);
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.try_lock().is_none());
        }
        assert_eq!(*m.try_lock().unwrap(), 8);
    }
}
