//! Counting semaphores.
//!
//! Grounded on `r3_kernel`'s `semaphore.rs`: a count plus a wait queue,
//! `wait`/`poll`/`signal` built on the same block/unblock primitives as
//! `mutex.rs`. The teacher caps the count at a compile-time `maximum` per
//! object; this crate keeps that as an `Option<u32>` so a semaphore can
//! also be created with no upper bound (the "unbounded" case), since a
//! `u32::MAX` sentinel would make every `signal()` need to special-case the
//! one count value that should never wrap.
use crate::config::Config;
use crate::critical::CriticalSection;
use crate::error::{Error, UnblockReason};
use crate::port::Port;
use crate::scheduler::Kernel;
use crate::thread::{ThreadId, WaitTarget};
use crate::tick::Duration;
use crate::utils::arena::{Arena, Handle};
use crate::wait::WaitQueue;

pub type SemaphoreId = Handle;

pub struct Semaphore {
    count: u32,
    maximum: Option<u32>,
    waiters: WaitQueue,
}

impl Semaphore {
    pub fn count(&self) -> u32 {
        self.count
    }
}

pub struct SemaphoreTable {
    semaphores: Arena<Semaphore>,
}

impl SemaphoreTable {
    pub const fn new() -> Self {
        Self {
            semaphores: Arena::new(),
        }
    }

    /// Construct with `count = min(initial, maximum)` — an `initial` above
    /// `maximum` is truncated, not rejected (§4.4: "Initial is truncated to
    /// max if larger").
    pub fn create(&mut self, initial: u32, maximum: Option<u32>) -> Result<SemaphoreId, Error> {
        let count = match maximum {
            Some(maximum) => initial.min(maximum),
            None => initial,
        };
        Ok(self.semaphores.insert(Semaphore {
            count,
            maximum,
            waiters: WaitQueue::new(),
        }))
    }

    pub fn destroy(&mut self, id: SemaphoreId) -> Option<()> {
        self.semaphores.remove(id).map(|_| ())
    }

    pub fn get(&self, id: SemaphoreId) -> Option<&Semaphore> {
        self.semaphores.get(id)
    }

    /// Release one token, waking the highest-priority waiter if any.
    /// Returns [`Error::Eoverflow`] if this would exceed the semaphore's
    /// maximum.
    pub fn signal<P: Port, C: Config>(
        &mut self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        id: SemaphoreId,
    ) -> Result<(), Error> {
        let sem = self.semaphores.get_mut(id).ok_or(Error::Einval)?;

        if let Some(waiter) = sem.waiters.pop_highest() {
            // Hand the token directly to the waiter without touching
            // `count`, preserving the invariant that at most one thread
            // ever observes a given unit of the semaphore.
            kernel.unblock(cs, waiter, UnblockReason::Normal);
            return Ok(());
        }

        if let Some(maximum) = sem.maximum {
            if sem.count >= maximum {
                return Err(Error::Eoverflow);
            }
        }
        sem.count += 1;
        Ok(())
    }

    /// Acquire a token, blocking (optionally with a timeout) if none is
    /// available.
    pub fn wait<P: Port, C: Config>(
        &mut self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        id: SemaphoreId,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.wait_inner(kernel, cs, id, Some(timeout))
    }

    /// Acquire a token without blocking.
    pub fn try_wait<P: Port, C: Config>(
        &mut self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        id: SemaphoreId,
    ) -> Result<(), Error> {
        self.wait_inner(kernel, cs, id, None)
    }

    fn wait_inner<P: Port, C: Config>(
        &mut self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        id: SemaphoreId,
        blocking: Option<Option<Duration>>,
    ) -> Result<(), Error> {
        let current = kernel.current().ok_or(Error::Eperm)?;
        let sem = self.semaphores.get_mut(id).ok_or(Error::Einval)?;

        if sem.count > 0 {
            sem.count -= 1;
            return Ok(());
        }

        let Some(timeout) = blocking else {
            return Err(Error::Eagain);
        };

        let priority = kernel.thread(current).ok_or(Error::Einval)?.effective_priority;
        sem.waiters.insert(current, priority);

        let deadline = timeout.map(|d| kernel.now() + d);
        let reason = kernel.block_current(cs, WaitTarget::Semaphore(id), deadline)?;
        match reason {
            UnblockReason::TimedOut => {
                if let Some(sem) = self.semaphores.get_mut(id) {
                    sem.waiters.remove(current);
                }
                Err(Error::Etimedout)
            }
            _ => Ok(()),
        }
    }

    pub fn remove_waiter(&mut self, thread: ThreadId) {
        for (_, sem) in self.semaphores.iter_mut() {
            sem.waiters.remove(thread);
        }
    }
}

impl Default for SemaphoreTable {
    fn default() -> Self {
        Self::new()
    }
}
