//! Critical-section-gated interior mutability.
//!
//! The kernel achieves atomicity by raising the interrupt-priority mask:
//! every mutation of scheduler lists, wait-lists, pending/queued signals, or
//! the timer list happens while a [`CriticalSection`] is held.
//! `r3_kernel` enforces "no access without the token" at compile time with
//! `tokenlock`'s singleton tokens; this reshaping uses a plain `UnsafeCell`
//! plus a debug-only reentrancy counter instead, since without the teacher's
//! const-generic `Traits` parameter there is exactly one critical-section
//! type in the program and the extra type-level machinery buys nothing here.
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::port::Port;

static DEPTH: AtomicUsize = AtomicUsize::new(0);

/// RAII proof that the kernel's critical section is held.
///
/// Obtained from [`CriticalSection::new`]. While one is alive, the tick
/// source and any interrupt that could reenter the kernel are masked.
/// Dropping it restores the previous mask state via [`Port::leave_critical`].
pub struct CriticalSection<P: Port> {
    cookie: P::Cookie,
    _not_send_sync: PhantomData<*const ()>,
}

impl<P: Port> CriticalSection<P> {
    /// Enter the kernel's critical section.
    #[inline]
    pub fn new() -> Self {
        let cookie = P::enter_critical();
        DEPTH.fetch_add(1, Ordering::Relaxed);
        Self {
            cookie,
            _not_send_sync: PhantomData,
        }
    }

    /// Reborrow `self` for a shorter lifetime, the way `r3_kernel`'s
    /// `CpuLockGuard::borrow_mut` does for its token — callers should prefer
    /// this over constructing a second `CriticalSection`, which would mask
    /// interrupts redundantly (though not unsoundly; `enter_critical` is
    /// specified as reentrant).
    #[inline]
    pub fn borrow(&mut self) -> &mut Self {
        self
    }
}

impl<P: Port> Drop for CriticalSection<P> {
    #[inline]
    fn drop(&mut self) {
        DEPTH.fetch_sub(1, Ordering::Relaxed);
        // Safety: `cookie` was produced by the matching `enter_critical` and
        // no other `CriticalSection` has been constructed since (this type
        // isn't `Clone`/`Copy`, and isn't `Send`/`Sync`, so nesting can only
        // happen through `Port::enter_critical`'s own reentrancy contract,
        // which this type never exercises twice for one cookie).
        unsafe { P::leave_critical(self.cookie) };
    }
}

/// True if a [`CriticalSection`] is currently held somewhere on this core.
///
/// Used by `debug_assert!`s at kernel-internal invariant boundaries; never
/// consulted to make a correctness decision on the non-debug path.
#[inline]
pub fn is_locked() -> bool {
    DEPTH.load(Ordering::Relaxed) > 0
}

/// A cell that can only be read or written while a [`CriticalSection`] is
/// held, analogous to `r3_kernel`'s `klock::CpuLockCell`.
pub struct KernelCell<T> {
    value: UnsafeCell<T>,
}

// Safety: all access is gated by `CriticalSection`, which can only exist
// while interrupts (and therefore the kernel's single logical thread of
// control) are masked.
unsafe impl<T: Send> Sync for KernelCell<T> {}

impl<T> KernelCell<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub fn get<P: Port>(&self, _cs: &CriticalSection<P>) -> &T {
        // Safety: `_cs` proves the critical section is held, and the cell is
        // `!Sync` for any access path that doesn't go through it.
        unsafe { &*self.value.get() }
    }

    #[inline]
    pub fn get_mut<P: Port>(&self, _cs: &mut CriticalSection<P>) -> &mut T {
        // Safety: see `get`; `&mut CriticalSection` additionally proves
        // there is no other live borrow through this same cell right now.
        unsafe { &mut *self.value.get() }
    }

    #[inline]
    pub fn replace<P: Port>(&self, cs: &mut CriticalSection<P>, value: T) -> T {
        core::mem::replace(self.get_mut(cs), value)
    }

    /// Escape hatch for code that runs before the scheduler exists (e.g.
    /// static initializers) and therefore has no `CriticalSection` to show.
    ///
    /// # Safety
    ///
    /// The caller must guarantee exclusive access: either no other code can
    /// be running yet, or a critical section is in fact held and the caller
    /// simply doesn't have the token in scope.
    #[inline]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.value.get() }
    }
}

impl<T: Default> Default for KernelCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
