//! Spinlocks: test-and-set, reader-writer, and ticket variants
//!
//! All three are strictly non-reentrant. The test-and-set lock carries the
//! IRQ-save acquisition used by every lock shared with interrupt context:
//! RFLAGS is saved and interrupts are masked before the acquire, and both
//! are restored when the guard drops (unlock first, then flag restore, in
//! that order).

use core::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use crate::arch::cpu;

// ---------------------------------------------------------------------------
// Test-and-set spinlock
// ---------------------------------------------------------------------------

/// Test-and-set spinlock.
///
/// Contended waiters spin on a relaxed load with a CPU pause hint and only
/// retry the exchange once the word reads unlocked, keeping the cache line
/// in shared state instead of bouncing it between cores.
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: The lock word serializes all access to `data`; sending the lock
// to another thread is safe whenever the payload itself can be sent.
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}
// SAFETY: Only one guard can exist at a time, so shared references to the
// lock never yield aliased mutable access to the payload.
unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    fn acquire(&self) {
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    /// Acquire the lock, spinning until it is available.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.acquire();
        SpinLockGuard { lock: self }
    }

    /// Try to acquire the lock without spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinLockGuard { lock: self })
        }
    }

    /// Acquire the lock with local interrupts masked.
    ///
    /// Required for any lock that an interrupt handler may also take: the
    /// handler would otherwise spin forever on a lock its own core holds.
    pub fn lock_irqsave(&self) -> IrqSpinLockGuard<'_, T> {
        let flags = cpu::save_and_disable_interrupts();
        self.acquire();
        IrqSpinLockGuard { lock: self, flags }
    }

    /// Whether the lock is currently held (racy, diagnostics only).
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Holding the guard means the lock word is set; no other
        // reference to the payload exists until this guard drops.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: As above; the guard is unique.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

pub struct IrqSpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    flags: u64,
}

impl<T: ?Sized> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Holding the guard means the lock word is set; no other
        // reference to the payload exists until this guard drops.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: As above; the guard is unique.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        // Unlock before restoring RFLAGS so a pending interrupt taken the
        // instant interrupts re-enable can immediately acquire the lock.
        self.lock.release();
        cpu::restore_interrupts(self.flags);
    }
}

/// Acquire two spinlocks in address order.
///
/// Two code paths that each need both locks must take them in a globally
/// consistent order; address order is that order.
pub fn lock_pair<'a, T: ?Sized, U: ?Sized>(
    a: &'a SpinLock<T>,
    b: &'a SpinLock<U>,
) -> (SpinLockGuard<'a, T>, SpinLockGuard<'a, U>) {
    let a_addr = a as *const _ as *const () as usize;
    let b_addr = b as *const _ as *const () as usize;
    if a_addr < b_addr {
        let ga = a.lock();
        let gb = b.lock();
        (ga, gb)
    } else {
        let gb = b.lock();
        let ga = a.lock();
        (ga, gb)
    }
}

// ---------------------------------------------------------------------------
// Reader-writer spinlock
// ---------------------------------------------------------------------------

const RW_WRITER_BIT: u32 = 1 << 31;
const RW_READER_MASK: u32 = RW_WRITER_BIT - 1;

/// Reader-writer spinlock in a single atomic word.
///
/// Bit 31 is the writer flag; bits 30..0 count readers. A reader increment
/// that would carry into the writer bit is rejected and retried.
pub struct RwSpinLock<T: ?Sized> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: The state word serializes writers against readers and each other.
unsafe impl<T: ?Sized + Send> Send for RwSpinLock<T> {}
// SAFETY: Readers only receive shared references; the single writer holds
// the writer bit for the whole mutable borrow.
unsafe impl<T: ?Sized + Send + Sync> Sync for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> RwSpinLock<T> {
    pub fn read(&self) -> RwReadGuard<'_, T> {
        loop {
            let cur = self.state.load(Ordering::Relaxed);
            if cur & RW_WRITER_BIT != 0 {
                hint::spin_loop();
                continue;
            }
            let next = cur + 1;
            if next & RW_READER_MASK == 0 {
                // Reader count about to overflow into the writer bit.
                hint::spin_loop();
                continue;
            }
            if self
                .state
                .compare_exchange_weak(cur, next, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return RwReadGuard { lock: self };
            }
        }
    }

    pub fn try_read(&self) -> Option<RwReadGuard<'_, T>> {
        let cur = self.state.load(Ordering::Relaxed);
        if cur & RW_WRITER_BIT != 0 {
            return None;
        }
        let next = cur + 1;
        if next & RW_READER_MASK == 0 {
            return None;
        }
        self.state
            .compare_exchange(cur, next, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwReadGuard { lock: self })
    }

    pub fn write(&self) -> RwWriteGuard<'_, T> {
        loop {
            if self
                .state
                .compare_exchange_weak(0, RW_WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return RwWriteGuard { lock: self };
            }
            while self.state.load(Ordering::Relaxed) != 0 {
                hint::spin_loop();
            }
        }
    }

    pub fn try_write(&self) -> Option<RwWriteGuard<'_, T>> {
        self.state
            .compare_exchange(0, RW_WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwWriteGuard { lock: self })
    }
}

pub struct RwReadGuard<'a, T: ?Sized> {
    lock: &'a RwSpinLock<T>,
}

impl<T: ?Sized> Deref for RwReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The reader count is non-zero while this guard lives, so
        // no writer can hold the writer bit concurrently.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct RwWriteGuard<'a, T: ?Sized> {
    lock: &'a RwSpinLock<T>,
}

impl<T: ?Sized> Deref for RwWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The writer bit excludes all readers and other writers.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: As above; the writer bit grants exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Ticket spinlock
// ---------------------------------------------------------------------------

/// Ticket spinlock: FIFO-fair under contention.
///
/// Waiters take a ticket with a fetch-add and spin until the serving
/// counter reaches it, so arrival order is service order.
pub struct TicketLock<T: ?Sized> {
    next_ticket: AtomicU32,
    serving: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: The ticket pair serializes all access to `data`.
unsafe impl<T: ?Sized + Send> Send for TicketLock<T> {}
// SAFETY: Exactly one ticket is being served at any time.
unsafe impl<T: ?Sized + Send> Sync for TicketLock<T> {}

impl<T> TicketLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU32::new(0),
            serving: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> TicketLock<T> {
    pub fn lock(&self) -> TicketGuard<'_, T> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            hint::spin_loop();
        }
        TicketGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<TicketGuard<'_, T>> {
        let serving = self.serving.load(Ordering::Relaxed);
        let next = self.next_ticket.load(Ordering::Relaxed);
        if serving != next {
            return None;
        }
        self.next_ticket
            .compare_exchange(next, next.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| TicketGuard { lock: self })
    }
}

pub struct TicketGuard<'a, T: ?Sized> {
    lock: &'a TicketLock<T>,
}

impl<T: ?Sized> Deref for TicketGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: This core holds the ticket currently being served.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for TicketGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: As above; service is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for TicketGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.serving.fetch_add(1, Ordering::Release);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use std::thread;

    #[test]
    fn spinlock_excludes() {
        let lock = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().expect("incrementer thread panicked");
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn irqsave_guard_releases() {
        let lock = SpinLock::new(5u32);
        {
            let mut g = lock.lock_irqsave();
            *g = 7;
        }
        assert_eq!(*lock.lock(), 7);
        assert!(!lock.is_locked());
    }

    #[test]
    fn rwlock_many_readers_one_writer() {
        let lock = Arc::new(RwSpinLock::new(0u64));

        let r1 = lock.read();
        let r2 = lock.read();
        assert!(lock.try_write().is_none());
        drop(r1);
        drop(r2);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..5_000 {
                    *lock.write() += 1;
                }
            }));
        }
        for h in handles {
            h.join().expect("writer thread panicked");
        }
        assert_eq!(*lock.read(), 20_000);
    }

    #[test]
    fn writer_blocks_readers() {
        let lock = RwSpinLock::new(());
        let w = lock.write();
        assert!(lock.try_read().is_none());
        drop(w);
        assert!(lock.try_read().is_some());
    }

    #[test]
    fn ticket_lock_counts() {
        let lock = Arc::new(TicketLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().expect("ticket thread panicked");
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn ticket_try_lock() {
        let lock = TicketLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn lock_pair_is_consistent() {
        let a = SpinLock::new(1u32);
        let b = SpinLock::new(2u32);
        let (ga, gb) = lock_pair(&a, &b);
        assert_eq!(*ga + *gb, 3);
    }
}
