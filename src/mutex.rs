//! Mutexes with priority inheritance and priority ceiling protocols.
//!
//! `r3_kernel`'s `mutex.rs` only implements priority ceiling (`MutexProtocol`
//! has no "inherit" case there); this module adds the inheritance protocol
//! fresh, grounded on the teacher's pattern for recomputing a task's
//! effective priority from its held mutexes (`task::TaskCb::effective_priority`,
//! recomputed in `mutex::unlock` after the owner changes) and extended here
//! to walk the lock-wait chain, since one inheriting thread can itself be
//! blocked on a second mutex.
//!
//! Per the design notes, mutexes live in their own [`Arena`] rather than as
//! `&'static` objects the way `r3_kernel::mutex::MutexCb` does, so a
//! [`MutexId`] (not a raw pointer) is what a thread's
//! [`crate::thread::Thread::owned_mutexes`] and
//! [`crate::thread::WaitTarget::Mutex`] refer to.
use alloc::vec::Vec;

use crate::config::Config;
use crate::critical::CriticalSection;
use crate::error::{Error, UnblockReason};
use crate::port::Port;
use crate::scheduler::Kernel;
use crate::thread::{ThreadId, ThreadState, WaitTarget};
use crate::tick::{Duration, Tick};
use crate::utils::arena::{Arena, Handle};
use crate::wait::WaitQueue;

pub type MutexId = Handle;

/// How a mutex affects the effective priority of the thread that locks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// No effect on priority (still tracked for `owned_mutexes` bookkeeping,
    /// but contributes nothing to `effective_priority`).
    None,
    /// Priority inheritance: while a higher-priority thread waits on this
    /// mutex, the owner's effective priority is raised to match.
    Inherit,
    /// Priority ceiling: locking raises the owner's effective priority to
    /// `ceiling` unconditionally, for as long as `ceiling` is at least the
    /// caller's own priority.
    Ceiling(u8),
}

/// Locking behavior when the calling thread already owns the mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Re-locking by the owner blocks (self-deadlock; POSIX `PTHREAD_MUTEX_NORMAL`).
    Normal,
    /// Re-locking by the owner returns [`Error::Edeadlk`] instead of blocking.
    ErrorChecking,
    /// Re-locking by the owner succeeds and increments a recursion count, up
    /// to `Config::MAX_RECURSIVE_LOCKS`; the lock past that returns
    /// [`Error::Eagain`].
    Recursive,
}

pub struct Mutex {
    kind: Kind,
    protocol: Protocol,
    owner: Option<ThreadId>,
    recursion: u32,
    waiters: WaitQueue,
}

impl Mutex {
    pub fn is_locked(&self) -> bool {
        self.owner.is_some()
    }

    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }
}

/// The set of live mutexes, addressed by [`MutexId`].
pub struct MutexTable {
    mutexes: Arena<Mutex>,
}

impl MutexTable {
    pub const fn new() -> Self {
        Self {
            mutexes: Arena::new(),
        }
    }

    pub fn create(&mut self, kind: Kind, protocol: Protocol) -> MutexId {
        self.mutexes.insert(Mutex {
            kind,
            protocol,
            owner: None,
            recursion: 0,
            waiters: WaitQueue::new(),
        })
    }

    pub fn destroy(&mut self, id: MutexId) -> Option<()> {
        self.mutexes.remove(id).map(|_| ())
    }

    pub fn get(&self, id: MutexId) -> Option<&Mutex> {
        self.mutexes.get(id)
    }

    /// Try to lock `id` without blocking. On contention returns
    /// `Err(Error::Ebusy)`.
    pub fn try_lock<P: Port, C: Config>(
        &mut self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        id: MutexId,
    ) -> Result<(), Error> {
        self.lock_inner(kernel, cs, id, None)
    }

    /// Lock `id`, blocking (optionally with a timeout) if it's held.
    pub fn lock<P: Port, C: Config>(
        &mut self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        id: MutexId,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.lock_inner(kernel, cs, id, Some(timeout))
    }

    fn lock_inner<P: Port, C: Config>(
        &mut self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        id: MutexId,
        blocking: Option<Option<Duration>>,
    ) -> Result<(), Error> {
        let current = kernel.current().ok_or(Error::Eperm)?;
        let current_thread = kernel.thread(current).ok_or(Error::Einval)?;
        let current_priority = current_thread.effective_priority;
        let current_base_priority = current_thread.base_priority;

        let mutex = self.mutexes.get_mut(id).ok_or(Error::Einval)?;

        // §4.3/§7: the ceiling guard rejects on the caller's *base*
        // priority, not its possibly-boosted effective priority — a thread
        // whose effective priority is transiently above the ceiling (e.g.
        // via inheritance from an unrelated mutex) may still take this one.
        if let Protocol::Ceiling(ceiling) = mutex.protocol {
            if ceiling < current_base_priority {
                return Err(Error::Einval);
            }
        }

        match mutex.owner {
            None => {
                mutex.owner = Some(current);
                mutex.recursion = 1;
                log::debug!("mutex {:?} locked by {:?}", id, current);
                self.grant(kernel, cs, id, current);
                Ok(())
            }
            Some(owner) if owner == current => match mutex.kind {
                Kind::Recursive => {
                    if mutex.recursion >= C::MAX_RECURSIVE_LOCKS {
                        return Err(Error::Eagain);
                    }
                    mutex.recursion += 1;
                    Ok(())
                }
                Kind::ErrorChecking => Err(Error::Edeadlk),
                Kind::Normal => self.block_on(kernel, cs, id, current, current_priority, blocking),
            },
            Some(_) => self.block_on(kernel, cs, id, current, current_priority, blocking),
        }
    }

    fn block_on<P: Port, C: Config>(
        &mut self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        id: MutexId,
        current: ThreadId,
        current_priority: u8,
        blocking: Option<Option<Duration>>,
    ) -> Result<(), Error> {
        let Some(blocking) = blocking else {
            return Err(Error::Ebusy);
        };
        let mutex = self.mutexes.get_mut(id).ok_or(Error::Einval)?;
        mutex.waiters.insert(current, current_priority);
        self.propagate_inheritance(kernel, cs, id);

        let deadline = blocking.map(|d| kernel.now() + d);
        let reason = kernel.block_current(cs, WaitTarget::Mutex(id), deadline)?;
        match reason {
            UnblockReason::TimedOut => {
                if let Some(mutex) = self.mutexes.get_mut(id) {
                    mutex.waiters.remove(current);
                }
                Err(Error::Etimedout)
            }
            _ => Ok(()),
        }
    }

    /// Grant `id` to `thread` outright and wake it, without going through
    /// `lock_inner`. Used by `condvar::notify_*` to hand a woken waiter
    /// straight into ownership of the mutex it's re-acquiring, when that
    /// mutex happens to be free.
    pub fn grant_directly<P: Port, C: Config>(
        &mut self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        id: MutexId,
        thread: ThreadId,
    ) {
        if let Some(mutex) = self.mutexes.get_mut(id) {
            mutex.owner = Some(thread);
            mutex.recursion = 1;
        }
        self.grant(kernel, cs, id, thread);
        kernel.unblock(cs, thread, UnblockReason::Normal);
    }

    /// Queue an already-blocked `thread` directly onto `id`'s wait list and
    /// retarget its wait without ever making it Ready in between. Used by
    /// `condvar::notify_*` when the mutex a waiter is re-acquiring is still
    /// held by someone else.
    pub fn queue_for_handoff<P: Port, C: Config>(
        &mut self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        id: MutexId,
        thread: ThreadId,
        priority: u8,
    ) {
        if let Some(mutex) = self.mutexes.get_mut(id) {
            mutex.waiters.insert(thread, priority);
        }
        kernel.retarget_wait(thread, WaitTarget::Mutex(id));
        self.propagate_inheritance(kernel, cs, id);
    }

    /// Hand the mutex to `new_owner` (called either on an uncontended lock,
    /// or when `unlock` wakes the highest-priority waiter) and apply this
    /// mutex's protocol to the new owner's effective priority.
    fn grant<P: Port, C: Config>(
        &mut self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        id: MutexId,
        new_owner: ThreadId,
    ) {
        if let Some(thread) = kernel.thread_mut(new_owner) {
            if !thread.owned_mutexes.contains(&id) {
                thread.owned_mutexes.push(id);
            }
        }
        self.recompute_effective_priority(kernel, cs, new_owner);
    }

    /// A higher-priority waiter just joined `id`'s wait list (or a thread's
    /// own base priority just changed): walk the lock-wait chain, boosting
    /// each mutex owner in turn, stopping when a step makes no difference
    /// or the chain bottoms out in a thread that owns nothing further.
    fn propagate_inheritance<P: Port, C: Config>(
        &mut self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        start: MutexId,
    ) {
        let mut current_mutex = Some(start);
        // Bounded by the number of live mutexes; a cycle would mean two
        // mutexes each think the other's owner is blocked on them, which
        // `lock_inner` never creates.
        for _ in 0..self.mutexes.len() {
            let Some(mid) = current_mutex else { break };
            let Some(mutex) = self.mutexes.get(mid) else {
                break;
            };
            if mutex.protocol != Protocol::Inherit {
                break;
            }
            let Some(owner) = mutex.owner else { break };
            let Some(waiter_priority) = mutex.waiters.highest_priority() else {
                break;
            };
            let owner_priority = kernel.thread(owner).map(|t| t.effective_priority).unwrap_or(0);
            if waiter_priority <= owner_priority {
                break;
            }
            log::debug!(
                "mutex {:?}: inheriting priority {} to owner {:?}",
                mid,
                waiter_priority,
                owner
            );
            kernel.set_effective_priority(cs, owner, waiter_priority);

            current_mutex = match kernel.thread(owner).map(|t| &t.state) {
                Some(ThreadState::Blocked {
                    target: WaitTarget::Mutex(next),
                    ..
                }) => Some(*next),
                _ => None,
            };
        }
    }

    /// Unlock `id`. Errors if the calling thread isn't the owner
    /// ([`Error::Eperm`]), matching `r3_kernel::mutex::unlock`'s ownership
    /// check.
    pub fn unlock<P: Port, C: Config>(
        &mut self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        id: MutexId,
    ) -> Result<(), Error> {
        let current = kernel.current().ok_or(Error::Eperm)?;
        let mutex = self.mutexes.get_mut(id).ok_or(Error::Einval)?;

        if mutex.owner != Some(current) {
            return Err(Error::Eperm);
        }

        if mutex.recursion > 1 {
            mutex.recursion -= 1;
            return Ok(());
        }

        mutex.recursion = 0;
        mutex.owner = None;
        log::debug!("mutex {:?} unlocked by {:?}", id, current);
        if let Some(thread) = kernel.thread_mut(current) {
            thread.owned_mutexes.retain(|&m| m != id);
        }
        self.recompute_effective_priority(kernel, cs, current);

        let next_owner = self.mutexes.get_mut(id).and_then(|m| m.waiters.pop_highest());
        if let Some(next_owner) = next_owner {
            if let Some(mutex) = self.mutexes.get_mut(id) {
                mutex.owner = Some(next_owner);
                mutex.recursion = 1;
            }
            self.grant(kernel, cs, id, next_owner);
            kernel.unblock(cs, next_owner, UnblockReason::Normal);
        }
        Ok(())
    }

    /// Recompute `thread`'s effective priority from scratch: its base
    /// priority, boosted by the ceiling/highest-waiter contribution of
    /// every mutex it currently holds. Called after any change to the set
    /// of mutexes a thread owns, or to what's waiting on one of them.
    pub fn recompute_effective_priority<P: Port, C: Config>(
        &self,
        kernel: &mut Kernel<P, C>,
        cs: &mut CriticalSection<P>,
        thread: ThreadId,
    ) {
        let Some(t) = kernel.thread(thread) else {
            return;
        };
        let mut effective = t.base_priority;
        let owned: Vec<MutexId> = t.owned_mutexes.clone();
        for mid in owned {
            if let Some(mutex) = self.mutexes.get(mid) {
                match mutex.protocol {
                    Protocol::None => {}
                    Protocol::Ceiling(ceiling) => effective = effective.max(ceiling),
                    Protocol::Inherit => {
                        if let Some(p) = mutex.waiters.highest_priority() {
                            effective = effective.max(p);
                        }
                    }
                }
            }
        }
        kernel.set_effective_priority(cs, thread, effective);
    }

    /// Remove `thread` from every wait list it's queued on in this table
    /// (used when a thread is force-woken by a signal or destroyed).
    pub fn remove_waiter(&mut self, thread: ThreadId) {
        for (_, mutex) in self.mutexes.iter_mut() {
            mutex.waiters.remove(thread);
        }
    }
}

impl Default for MutexTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DefaultConfig};
    use crate::thread::Builder;

    struct TestPort;

    unsafe impl Port for TestPort {
        type Cookie = ();

        fn enter_critical() -> Self::Cookie {}

        unsafe fn leave_critical(_cookie: Self::Cookie) {}

        fn request_context_switch() {}

        unsafe fn initialize_stack(
            _stack: &mut [u8],
            _entry: unsafe extern "C" fn(usize),
            _arg: usize,
            _exit: unsafe extern "C" fn() -> !,
        ) -> *mut () {
            core::ptr::null_mut()
        }
    }

    struct FastConfig;

    impl Config for FastConfig {
        const TICK_FREQUENCY_HZ: u32 = 1000;
        const MAIN_THREAD_PRIORITY: u8 = 0;
        const MAIN_THREAD_QUEUED_SIGNALS: usize = 4;
        const MAIN_THREAD_SIGNAL_ACTIONS: usize = 32;
        const MAX_TIMERS: usize = 32;
        const ROUND_ROBIN_QUANTUM_TICKS: u32 = 2;
        const MAX_RECURSIVE_LOCKS: u32 = 2;
    }

    fn noop() -> alloc::boxed::Box<dyn FnOnce() + Send> {
        alloc::boxed::Box::new(|| {})
    }

    #[test]
    fn uncontended_lock_and_unlock_round_trips() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let mut mutexes = MutexTable::new();
        let id = mutexes.create(Kind::Normal, Protocol::None);

        let owner = kernel.spawn(&mut cs, 1, noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(owner));

        mutexes.lock(&mut kernel, &mut cs, id, None).unwrap();
        assert_eq!(mutexes.get(id).unwrap().owner(), Some(owner));
        mutexes.unlock(&mut kernel, &mut cs, id).unwrap();
        assert_eq!(mutexes.get(id).unwrap().owner(), None);
    }

    #[test]
    fn unlock_by_a_non_owner_is_rejected() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let mut mutexes = MutexTable::new();
        let id = mutexes.create(Kind::Normal, Protocol::None);

        let owner = kernel.spawn(&mut cs, 2, noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(owner));
        mutexes.lock(&mut kernel, &mut cs, id, None).unwrap();

        // A higher-priority thread preempts `owner` without ever touching
        // the mutex; `unlock` must still reject it as a non-owner.
        let intruder = kernel.spawn(&mut cs, 9, noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(intruder));
        assert_eq!(mutexes.unlock(&mut kernel, &mut cs, id), Err(Error::Eperm));
    }

    #[test]
    fn relocking_a_normal_mutex_from_its_owner_is_busy() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let mut mutexes = MutexTable::new();
        let id = mutexes.create(Kind::Normal, Protocol::None);

        let owner = kernel.spawn(&mut cs, 1, noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(owner));
        mutexes.lock(&mut kernel, &mut cs, id, None).unwrap();
        assert_eq!(mutexes.try_lock(&mut kernel, &mut cs, id), Err(Error::Ebusy));
    }

    #[test]
    fn relocking_an_error_checking_mutex_from_its_owner_is_rejected() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let mut mutexes = MutexTable::new();
        let id = mutexes.create(Kind::ErrorChecking, Protocol::None);

        let owner = kernel.spawn(&mut cs, 1, noop());
        kernel.reschedule(&mut cs);
        mutexes.lock(&mut kernel, &mut cs, id, None).unwrap();
        assert_eq!(mutexes.try_lock(&mut kernel, &mut cs, id), Err(Error::Edeadlk));
    }

    #[test]
    fn recursive_lock_is_capped_by_config() {
        let mut kernel = Kernel::<TestPort, FastConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let mut mutexes = MutexTable::new();
        let id = mutexes.create(Kind::Recursive, Protocol::None);

        let owner = kernel.spawn(&mut cs, 1, noop());
        kernel.reschedule(&mut cs);

        // First lock plus `FastConfig::MAX_RECURSIVE_LOCKS - 1` further
        // recursive locks succeed; the one past that is rejected.
        mutexes.lock(&mut kernel, &mut cs, id, None).unwrap();
        mutexes.lock(&mut kernel, &mut cs, id, None).unwrap();
        assert_eq!(mutexes.try_lock(&mut kernel, &mut cs, id), Err(Error::Eagain));

        // Unwinding the recursion releases the mutex only on the last unlock.
        mutexes.unlock(&mut kernel, &mut cs, id).unwrap();
        assert_eq!(mutexes.get(id).unwrap().owner(), Some(owner));
        mutexes.unlock(&mut kernel, &mut cs, id).unwrap();
        assert_eq!(mutexes.get(id).unwrap().owner(), None);
    }

    #[test]
    fn priority_inheritance_raises_owner_to_match_the_highest_waiter() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let mut mutexes = MutexTable::new();
        let id = mutexes.create(Kind::Normal, Protocol::Inherit);

        let owner = kernel.spawn_with(&mut cs, Builder::new(1), noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(owner));
        mutexes.lock(&mut kernel, &mut cs, id, None).unwrap();

        // A higher-priority thread spawns, preempts `owner`, then blocks on
        // the mutex `owner` holds: this must walk the inheritance chain and
        // raise `owner`'s effective priority to match.
        let waiter = kernel.spawn_with(&mut cs, Builder::new(5), noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(waiter));
        mutexes.lock(&mut kernel, &mut cs, id, None).unwrap();

        assert_eq!(kernel.current(), Some(owner));
        assert_eq!(kernel.get_effective_priority(owner), Some(5));

        mutexes.unlock(&mut kernel, &mut cs, id).unwrap();
        assert_eq!(kernel.get_effective_priority(owner), Some(1));
        assert_eq!(mutexes.get(id).unwrap().owner(), Some(waiter));
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(waiter));
    }

    #[test]
    fn ceiling_protocol_raises_the_owner_unconditionally() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let mut mutexes = MutexTable::new();
        let id = mutexes.create(Kind::Normal, Protocol::Ceiling(8));

        let owner = kernel.spawn(&mut cs, 2, noop());
        kernel.reschedule(&mut cs);
        mutexes.lock(&mut kernel, &mut cs, id, None).unwrap();
        assert_eq!(kernel.get_effective_priority(owner), Some(8));
        mutexes.unlock(&mut kernel, &mut cs, id).unwrap();
        assert_eq!(kernel.get_effective_priority(owner), Some(2));
    }

    #[test]
    fn locking_above_the_ceiling_is_rejected() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let mut mutexes = MutexTable::new();
        let id = mutexes.create(Kind::Normal, Protocol::Ceiling(3));

        let owner = kernel.spawn(&mut cs, 5, noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(owner));
        assert_eq!(mutexes.lock(&mut kernel, &mut cs, id, None), Err(Error::Einval));
    }

    #[test]
    fn ceiling_guard_checks_base_priority_not_a_transient_boost() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let mut mutexes = MutexTable::new();
        let inherit_id = mutexes.create(Kind::Normal, Protocol::Inherit);
        let ceiling_id = mutexes.create(Kind::Normal, Protocol::Ceiling(3));

        // `owner`'s base priority (1) is below the ceiling (3): locking the
        // ceiling mutex would be fine on its own.
        let owner = kernel.spawn_with(&mut cs, Builder::new(1), noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(owner));
        mutexes.lock(&mut kernel, &mut cs, inherit_id, None).unwrap();

        // A higher-priority waiter boosts `owner`'s *effective* priority to
        // 5 — above the ceiling — via inheritance on the unrelated mutex.
        let waiter = kernel.spawn_with(&mut cs, Builder::new(5), noop());
        kernel.reschedule(&mut cs);
        mutexes.lock(&mut kernel, &mut cs, inherit_id, None).unwrap();
        assert_eq!(kernel.current(), Some(owner));
        assert_eq!(kernel.get_effective_priority(owner), Some(5));

        // The ceiling guard must look at `owner`'s base priority (1), not
        // its transiently-boosted effective priority (5), and let this lock
        // through.
        assert_eq!(mutexes.lock(&mut kernel, &mut cs, ceiling_id, None), Ok(()));
    }
}
