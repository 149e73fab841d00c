//! Synchronization primitives
//!
//! Three spinlock flavors built on `core::sync::atomic`, plus safe global
//! initialization helpers. Every lock that can be taken from both thread
//! context and an interrupt handler must be acquired through the IRQ-save
//! path ([`spinlock::SpinLock::lock_irqsave`]); a plain acquisition in such
//! a path deadlocks the core the moment a nested handler retries the lock.

pub mod once_lock;
pub mod spinlock;

pub use once_lock::{GlobalState, OnceLock};
pub use spinlock::{lock_pair, RwSpinLock, SpinLock, TicketLock};
