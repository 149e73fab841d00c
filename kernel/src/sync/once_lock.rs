//! Safe one-shot global initialization without `static mut`.

use core::sync::atomic::{AtomicPtr, Ordering};

use spin::Mutex;

/// A cell that can be written exactly once and read forever after.
///
/// The no_std sibling of `std::sync::OnceLock`; the value is boxed so the
/// cell itself is a single atomic pointer.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&'static T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: A non-null pointer was published by `set()` via
            // `Box::into_raw`, and the Acquire load pairs with the Release
            // CAS there, so the pointee is fully initialized. The box is
            // never reclaimed while the cell is alive, giving 'static.
            Some(unsafe { &*ptr })
        }
    }

    /// Initialize the cell. Returns the value back if already set.
    pub fn set(&self, value: T) -> Result<(), T> {
        let ptr = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(value));
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            ptr,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: The CAS failed, so nobody else saw `ptr`; we are
                // reclaiming the box we just leaked.
                let boxed = unsafe { alloc::boxed::Box::from_raw(ptr) };
                Err(*boxed)
            }
        }
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: The value is reached only through the atomic pointer with
// acquire/release ordering; transferring the cell transfers the boxed T.
unsafe impl<T: Send> Send for OnceLock<T> {}
// SAFETY: `get` hands out shared references only; T must therefore be Sync,
// and initialization is serialized by the CAS.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        let ptr = self.inner.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: `&mut self` proves no outstanding references exist;
            // the pointer came from `Box::into_raw` in `set()`.
            unsafe {
                drop(alloc::boxed::Box::from_raw(ptr));
            }
        }
    }
}

/// Mutex-guarded global that starts empty and is filled during boot.
pub struct GlobalState<T> {
    inner: Mutex<Option<T>>,
}

impl<T> GlobalState<T> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Fill the global. Returns the value back if already initialized.
    pub fn init(&self, value: T) -> Result<(), T> {
        let mut guard = self.inner.lock();
        if guard.is_some() {
            Err(value)
        } else {
            *guard = Some(value);
            Ok(())
        }
    }

    /// Run `f` with a shared reference to the value, if initialized.
    pub fn with<R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        self.inner.lock().as_ref().map(f)
    }

    /// Run `f` with a mutable reference to the value, if initialized.
    pub fn with_mut<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        self.inner.lock().as_mut().map(f)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }
}

impl<T> Default for GlobalState<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn once_lock_sets_once() {
        let cell = OnceLock::new();
        assert!(cell.get().is_none());
        assert!(cell.set(42).is_ok());
        assert_eq!(cell.get(), Some(&42));
        assert_eq!(cell.set(7), Err(7));
        assert_eq!(cell.get(), Some(&42));
    }

    #[test]
    fn global_state_round_trip() {
        let state = GlobalState::new();
        assert!(!state.is_initialized());
        assert!(state.with(|_: &u32| ()).is_none());

        assert!(state.init(10u32).is_ok());
        assert_eq!(state.init(11u32), Err(11));

        state.with_mut(|v| *v += 5);
        assert_eq!(state.with(|v| *v), Some(15));
    }
}
