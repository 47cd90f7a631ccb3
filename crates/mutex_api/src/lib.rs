//! A minimal mutex abstraction.
//!
//! `ov6fs` is built as a stack of crates that each need exclusive access to
//! some piece of state (a sector cache pool, an open-inode table, a single
//! inode's fields) without caring *how* that exclusion is implemented. This
//! trait is the seam: every layer above it is generic over `Mutex`, and the
//! concrete lock (currently [`StdMutex`], a thin wrapper over
//! [`std::sync::Mutex`]) is chosen once, at the top, by whoever assembles a
//! [`ov6fs::FileSystem`](../ov6fs/struct.FileSystem.html).
#![cfg_attr(not(feature = "std"), no_std)]

use core::ops::DerefMut;

/// A lock guarding a single piece of data.
pub trait Mutex {
    /// The data that the mutex protects.
    type Data;

    /// The guard returned by [`lock`](Mutex::lock).
    type Guard<'a>: DerefMut<Target = Self::Data>
    where
        Self: 'a;

    /// Creates a new mutex wrapping `data`.
    fn new(data: Self::Data) -> Self;

    /// Locks the mutex, blocking the caller until it is available.
    fn lock(&self) -> Self::Guard<'_>;
}

#[cfg(feature = "std")]
mod std_mutex {
    use std::sync::{Mutex as InnerMutex, MutexGuard};

    /// A [`Mutex`](super::Mutex) backed by [`std::sync::Mutex`].
    ///
    /// Poisoning is treated as a fatal invariant violation: a panic while
    /// holding the lock means the protected state (a cache line, an
    /// open-inode table, an inode's fields) may be half-updated, and this
    /// crate has no crash-consistency story to recover from that.
    #[derive(Debug, Default)]
    pub struct StdMutex<T>(InnerMutex<T>);

    impl<T> super::Mutex for StdMutex<T> {
        type Data = T;
        type Guard<'a>
            = MutexGuard<'a, T>
        where
            T: 'a;

        fn new(data: T) -> Self {
            Self(InnerMutex::new(data))
        }

        fn lock(&self) -> MutexGuard<'_, T> {
            self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }
    }
}

#[cfg(feature = "std")]
pub use std_mutex::StdMutex;

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn lock_roundtrips_data() {
        let m = StdMutex::new(5);
        *m.lock() += 1;
        assert_eq!(*m.lock(), 6);
    }
}
