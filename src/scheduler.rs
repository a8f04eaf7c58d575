//! The run-queue and the single kernel state machine built around it.
//!
//! `r3_kernel` spreads this across a `KernelTraits`-parameterized `System<Traits>`
//! zero-sized type, a `Traits::state()` singleton, and a `task::readyqueue::Queue`
//! trait object chosen at compile time. Per the design notes ("express as a
//! single kernel struct" instead of trait-dispatched generics), this crate
//! collapses all of that into one concrete [`Kernel`], generic only over the
//! architecture [`Port`] and the compile-time [`Config`] — both of which the
//! host application still picks once, at the top of its binary.
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::marker::PhantomData;

use crate::config::Config;
use crate::critical::CriticalSection;
use crate::error::{Error, UnblockReason};
use crate::port::Port;
use crate::priobitmap::PriorityBitmap;
use crate::thread::{Builder, Policy, Thread, ThreadId, ThreadState, WaitTarget};
use crate::tick::{Duration, Tick};
use crate::timer::Supervisor;
use crate::utils::arena::Arena;

/// The kernel's entire mutable state: the thread arena, the 256-bucket
/// ready queue and its priority summary, the currently running thread, the
/// tick clock, and the software timer supervisor.
///
/// All mutation happens with a [`CriticalSection`] held; `Kernel` itself
/// carries no internal locking; it *is* the data the critical section
/// protects.
pub struct Kernel<P: Port, C: Config> {
    threads: Arena<Thread>,
    ready: Vec<VecDeque<ThreadId>>,
    ready_bitmap: PriorityBitmap,
    current: Option<ThreadId>,
    tick: Tick,
    timers: Supervisor,
    context_switch_count: u64,
    /// Terminated, detached threads awaiting reclamation. Not freed the
    /// instant they become reclaimable: the idle thread drains this instead,
    /// so freeing a TCB never happens deep inside whatever call happened to
    /// notice the thread was both terminated and detached.
    pending_reclaim: Vec<ThreadId>,
    _port: PhantomData<P>,
    _config: PhantomData<C>,
}

impl<P: Port, C: Config> Kernel<P, C> {
    pub fn new() -> Self {
        let mut ready = Vec::with_capacity(256);
        ready.resize_with(256, VecDeque::new);
        Self {
            threads: Arena::new(),
            ready,
            ready_bitmap: PriorityBitmap::new(),
            current: None,
            tick: Tick::ZERO,
            timers: Supervisor::new(),
            context_switch_count: 0,
            pending_reclaim: Vec::new(),
            _port: PhantomData,
            _config: PhantomData,
        }
    }

    #[inline]
    pub fn current(&self) -> Option<ThreadId> {
        self.current
    }

    #[inline]
    pub fn now(&self) -> Tick {
        self.tick
    }

    #[inline]
    pub fn context_switch_count(&self) -> u64 {
        self.context_switch_count
    }

    pub fn thread(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.get(id)
    }

    pub fn thread_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.get_mut(id)
    }

    /// `id`'s current effective priority.
    pub fn get_effective_priority(&self, id: ThreadId) -> Option<u8> {
        self.threads.get(id).map(Thread::effective_priority)
    }

    /// `id`'s current run state.
    pub fn get_state(&self, id: ThreadId) -> Option<ThreadState> {
        self.threads.get(id).map(Thread::state)
    }

    /// `id`'s stack high water mark, if it was created with a tracked stack.
    pub fn get_stack_high_water_mark(&self, id: ThreadId) -> Option<usize> {
        self.threads.get(id).and_then(Thread::stack_high_water_mark)
    }

    /// Create a new thread in the Ready state and make it eligible for
    /// scheduling. Grounded on `r3_kernel::task::activate`, minus the
    /// separate Dormant-to-Ready transition: this crate has no notion of an
    /// inactive thread object. Equivalent to
    /// `Builder::new(priority).spawn(self, cs, entry)`.
    pub fn spawn(
        &mut self,
        cs: &mut CriticalSection<P>,
        priority: u8,
        entry: Box<dyn FnOnce() + Send>,
    ) -> ThreadId {
        self.spawn_with(cs, Builder::new(priority), entry)
    }

    /// Create a thread from a fully-configured [`Builder`] (priority,
    /// scheduling policy, stack tracking, queued-signal capacity) and make
    /// it eligible for scheduling.
    pub fn spawn_with(
        &mut self,
        _cs: &mut CriticalSection<P>,
        builder: Builder,
        entry: Box<dyn FnOnce() + Send>,
    ) -> ThreadId {
        let thread = builder.into_thread(ThreadId::from_index(0), entry);
        let priority = thread.base_priority;
        let id = self.threads.insert(thread);
        // The arena only knows the handle after insertion; patch it in.
        self.threads.get_mut(id).unwrap().id = id;
        self.push_ready(id, priority);
        id
    }

    fn push_ready(&mut self, id: ThreadId, priority: u8) {
        self.ready[priority as usize].push_back(id);
        self.ready_bitmap.set(priority);
    }

    fn pop_ready_at(&mut self, priority: u8) -> Option<ThreadId> {
        let bucket = &mut self.ready[priority as usize];
        let popped = bucket.pop_front();
        if bucket.is_empty() {
            self.ready_bitmap.clear(priority);
        }
        popped
    }

    fn remove_ready(&mut self, id: ThreadId, priority: u8) -> bool {
        let bucket = &mut self.ready[priority as usize];
        if let Some(i) = bucket.iter().position(|&t| t == id) {
            bucket.remove(i);
            if bucket.is_empty() {
                self.ready_bitmap.clear(priority);
            }
            true
        } else {
            false
        }
    }

    /// Re-run the scheduling decision: if a higher-priority thread than the
    /// one currently marked Running is ready, switch to it. Grounded on
    /// `r3_kernel::task::unlock_cpu_and_check_preemption`, simplified since
    /// this crate has no CPU Lock nesting distinct from [`CriticalSection`].
    ///
    /// Any code that readies a thread, changes a thread's effective
    /// priority, or removes the running thread must call this before
    /// releasing the critical section.
    pub fn reschedule(&mut self, _cs: &mut CriticalSection<P>) {
        let current_priority = self
            .current
            .and_then(|id| self.threads.get(id))
            .map(|t| t.effective_priority);

        let highest_ready = self.ready_bitmap.highest_set();

        let should_switch = match (highest_ready, current_priority) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(ready_p), Some(cur_p)) => ready_p > cur_p,
        };

        if !should_switch {
            return;
        }

        let Some(next_priority) = highest_ready else {
            return;
        };
        let Some(next) = self.pop_ready_at(next_priority) else {
            return;
        };

        if let Some(prev) = self.current.take() {
            if let Some(prev_thread) = self.threads.get_mut(prev) {
                if prev_thread.state == ThreadState::Running {
                    prev_thread.state = ThreadState::Ready;
                    let prev_priority = prev_thread.effective_priority;
                    self.push_ready(prev, prev_priority);
                }
            }
        }

        if let Some(next_thread) = self.threads.get_mut(next) {
            next_thread.state = ThreadState::Running;
            if next_thread.policy == Policy::RoundRobin {
                next_thread.round_robin_remaining = C::ROUND_ROBIN_QUANTUM_TICKS;
            }
        }
        log::trace!("context switch: -> {:?} (priority {})", next, next_priority);
        self.current = Some(next);
        self.context_switch_count += 1;
        P::request_context_switch();
    }

    /// Move the calling thread out of Running and into Blocked, waiting on
    /// `target` until `unblock` is called on it (or `deadline` elapses, if
    /// set). Returns the reason the thread eventually resumed.
    ///
    /// # Contract
    ///
    /// Like `r3_kernel`'s task-wait primitives, this call's Rust-level
    /// "return" models the point at which the architecture port resumes
    /// this thread's saved execution context (the actual stack switch is a
    /// [`Port`] responsibility this crate never implements, per its scope).
    /// The bookkeeping below runs at block time; the value returned is
    /// whatever [`Self::unblock`] or the tick handler later stashes on the
    /// thread's control block.
    pub fn block_current(
        &mut self,
        cs: &mut CriticalSection<P>,
        target: WaitTarget,
        deadline: Option<Tick>,
    ) -> Result<UnblockReason, Error> {
        let Some(current) = self.current else {
            return Err(Error::Eperm);
        };
        {
            let thread = self.threads.get_mut(current).ok_or(Error::Einval)?;
            thread.state = ThreadState::Blocked { target, deadline };
        }
        log::trace!("{:?} blocked on {:?}", current, target);
        if let Some(deadline) = deadline {
            self.timers.schedule_wakeup(current, deadline);
        }
        self.current = None;
        self.reschedule(cs);
        let reason = self.take_unblock_reason(current);
        log::trace!("{:?} resumed: {:?}", current, reason);
        Ok(reason)
    }

    /// Called once by the thread that discovers why `id` stopped blocking,
    /// after it has already removed `id` from whatever wait list it owned.
    fn take_unblock_reason(&mut self, id: ThreadId) -> UnblockReason {
        self.threads
            .get(id)
            .map(|t| t.last_unblock_reason)
            .unwrap_or(UnblockReason::Normal)
    }

    /// Move `id` from Blocked back to Ready. The caller is responsible for
    /// having already removed `id` from the object-specific wait list it
    /// was queued on; this only flips the thread state and the run-queue
    /// membership, mirroring `r3_kernel::wait::wake_up_all_tasks`'s final
    /// step.
    pub fn unblock(&mut self, cs: &mut CriticalSection<P>, id: ThreadId, reason: UnblockReason) {
        let priority = match self.threads.get_mut(id) {
            Some(thread) if matches!(thread.state, ThreadState::Blocked { .. }) => {
                thread.state = ThreadState::Ready;
                thread.last_unblock_reason = reason;
                self.timers.cancel_wakeup(id);
                thread.effective_priority
            }
            _ => return,
        };
        self.push_ready(id, priority);
        self.reschedule(cs);
    }

    /// Voluntarily give up the CPU to a thread of equal priority, if any.
    /// The calling thread stays Ready rather than Blocked.
    pub fn yield_now(&mut self, cs: &mut CriticalSection<P>) {
        let Some(current) = self.current else {
            return;
        };
        let priority = match self.threads.get(current) {
            Some(t) => t.effective_priority,
            None => return,
        };
        if self.ready[priority as usize].is_empty() {
            return;
        }
        if let Some(thread) = self.threads.get_mut(current) {
            thread.state = ThreadState::Ready;
        }
        self.push_ready(current, priority);
        self.current = None;
        self.reschedule(cs);
    }

    /// Advance the tick clock by one and wake any thread or timer whose
    /// deadline has arrived. Intended to be called from the host's periodic
    /// tick source at `C::TICK_FREQUENCY_HZ`.
    pub fn on_tick(&mut self, cs: &mut CriticalSection<P>) {
        self.tick = self.tick + Duration::ticks(1);
        let now = self.tick;

        for id in self.timers.drain_due_wakeups(now) {
            if let Some(thread) = self.threads.get_mut(id) {
                if matches!(thread.state, ThreadState::Blocked { .. }) {
                    thread.state = ThreadState::Ready;
                    thread.last_unblock_reason = UnblockReason::TimedOut;
                    let priority = thread.effective_priority;
                    self.push_ready(id, priority);
                }
            }
        }

        self.timers.fire_due_timers(now, cs);
        self.tick_round_robin(cs);
        self.reschedule(cs);
    }

    /// Charge the running thread's round-robin quantum, if it's on
    /// `Policy::RoundRobin`, and rotate it to the back of its priority level
    /// once the quantum is spent — but only if another thread is actually
    /// waiting at that level, so a lone round-robin thread never pays for an
    /// unnecessary context switch.
    fn tick_round_robin(&mut self, cs: &mut CriticalSection<P>) {
        let Some(current) = self.current else {
            return;
        };
        let Some(thread) = self.threads.get_mut(current) else {
            return;
        };
        if thread.policy != Policy::RoundRobin {
            return;
        }
        if thread.round_robin_remaining > 0 {
            thread.round_robin_remaining -= 1;
        }
        if thread.round_robin_remaining > 0 {
            return;
        }
        let priority = thread.effective_priority;
        if self.ready[priority as usize].is_empty() {
            return;
        }
        thread.state = ThreadState::Ready;
        self.current = None;
        self.push_ready(current, priority);
        self.reschedule(cs);
    }

    /// Mark the calling thread Terminated, hand off to its joiner if one is
    /// waiting (or reclaim its arena slot immediately if it was already
    /// detached), and dispatch the next ready thread. Called by the host
    /// integration once a thread's entry function returns — this crate owns
    /// no trampoline of its own that could call it automatically.
    pub fn exit_current(&mut self, cs: &mut CriticalSection<P>) {
        let Some(current) = self.current.take() else {
            return;
        };
        let (joiner, detached) = match self.threads.get_mut(current) {
            Some(thread) => {
                thread.state = ThreadState::Terminated;
                thread.entry = None;
                (thread.joiner.take(), thread.detached)
            }
            None => return,
        };
        log::debug!("{:?} exited", current);
        if let Some(joiner) = joiner {
            self.unblock(cs, joiner, UnblockReason::Normal);
        } else if detached {
            self.pending_reclaim.push(current);
        }
        self.reschedule(cs);
    }

    /// Block the calling thread until `target` exits, then reclaim its
    /// arena slot. Grounded on POSIX `pthread_join`: a detached thread can't
    /// be joined, nor can a thread join itself (`Error::Einval` either way),
    /// and only one thread may be joining a given target at a time
    /// (`Error::Ebusy`).
    pub fn join(&mut self, cs: &mut CriticalSection<P>, target: ThreadId) -> Result<(), Error> {
        let current = self.current.ok_or(Error::Eperm)?;
        if target == current {
            return Err(Error::Einval);
        }
        loop {
            let thread = self.threads.get(target).ok_or(Error::Einval)?;
            if thread.detached {
                return Err(Error::Einval);
            }
            if let Some(existing) = thread.joiner {
                if existing != current {
                    return Err(Error::Ebusy);
                }
            }
            if matches!(thread.state, ThreadState::Terminated) {
                self.threads.remove(target);
                return Ok(());
            }
            if let Some(thread) = self.threads.get_mut(target) {
                thread.joiner = Some(current);
            }
            self.block_current(cs, WaitTarget::Join(target), None)?;
        }
    }

    /// Detach `target`: no thread may ever `join` it again, and once it
    /// exits its TCB is queued for [`Self::reclaim_detached_threads`]
    /// instead of waiting for a joiner that will never come. `EINVAL` if
    /// `target` is already detached. Gated by the `thread-detach` feature,
    /// mirroring `Config`'s `THREAD_DETACH_ENABLE` knob.
    #[cfg(feature = "thread-detach")]
    pub fn detach(&mut self, target: ThreadId) -> Result<(), Error> {
        let thread = self.threads.get_mut(target).ok_or(Error::Einval)?;
        if thread.detached {
            return Err(Error::Einval);
        }
        if thread.joiner.is_some() {
            return Err(Error::Ebusy);
        }
        thread.detached = true;
        if matches!(thread.state, ThreadState::Terminated) {
            self.pending_reclaim.push(target);
        }
        Ok(())
    }

    /// Free the arena slot of every terminated, detached thread queued since
    /// the last call. Intended to be called in a loop from the lowest-
    /// priority ("idle") thread, so freeing TCBs never happens deep inside
    /// whatever higher-priority call happened to notice one was reclaimable
    /// — detached threads transfer stack ownership to the idle thread's
    /// reclamation path. Returns how many were freed.
    pub fn reclaim_detached_threads(&mut self) -> usize {
        let count = self.pending_reclaim.len();
        for id in self.pending_reclaim.drain(..) {
            self.threads.remove(id);
        }
        count
    }

    /// Remove `id` from the ready queue or its current wait list, and mark
    /// it Ready immediately, regardless of what it was waiting for — used
    /// by forced-wakeup style operations (signal delivery, object
    /// destruction).
    pub fn force_ready(&mut self, cs: &mut CriticalSection<P>, id: ThreadId, reason: UnblockReason) {
        if let Some(thread) = self.threads.get(id) {
            if matches!(thread.state, ThreadState::Ready | ThreadState::Running) {
                return;
            }
        }
        self.unblock(cs, id, reason);
    }

    /// Change a thread's base priority. If the
    /// thread currently holds a mutex, its effective priority may still be
    /// boosted by inheritance; full recomputation of an inheritance chain
    /// after a base-priority change is `mutex`'s responsibility
    /// (`mutex::recompute_effective_priority`), since only `mutex` knows
    /// which threads are waiting on which of this thread's held mutexes.
    /// This method applies the simple case directly so a thread holding no
    /// mutex always gets its new priority immediately.
    pub fn set_priority(&mut self, cs: &mut CriticalSection<P>, id: ThreadId, priority: u8) {
        let Some(thread) = self.threads.get_mut(id) else {
            return;
        };
        thread.base_priority = priority;
        let old_effective = thread.effective_priority;
        let new_effective = if thread.owned_mutexes.is_empty() {
            priority
        } else {
            thread.effective_priority.max(priority)
        };
        thread.effective_priority = new_effective;

        if old_effective != new_effective {
            match thread.state {
                ThreadState::Ready => {
                    self.remove_ready(id, old_effective);
                    self.push_ready(id, new_effective);
                }
                _ => {}
            }
        }
        self.reschedule(cs);
    }

    pub fn timers_mut(&mut self) -> &mut Supervisor {
        &mut self.timers
    }

    /// Change what a still-blocked thread is waiting for, keeping its
    /// deadline. Used by `condvar::notify_all`'s mutex hand-off, which
    /// moves a waiter straight from the condvar's wait list onto the
    /// mutex's without an intervening Ready state.
    pub fn retarget_wait(&mut self, id: ThreadId, new_target: WaitTarget) {
        if let Some(thread) = self.threads.get_mut(id) {
            if let ThreadState::Blocked { deadline, .. } = thread.state {
                thread.state = ThreadState::Blocked {
                    target: new_target,
                    deadline,
                };
            }
        }
    }

    /// Directly set a thread's effective priority, repositioning it in the
    /// ready queue if needed. Used by `mutex`'s priority-inheritance
    /// recomputation, which already knows the correct new value (the max of
    /// the thread's base priority and every mutex-waiter it currently
    /// inherits from).
    pub fn set_effective_priority(&mut self, cs: &mut CriticalSection<P>, id: ThreadId, new_effective: u8) {
        let Some(thread) = self.threads.get_mut(id) else {
            return;
        };
        let old_effective = thread.effective_priority;
        if old_effective == new_effective {
            return;
        }
        thread.effective_priority = new_effective;
        if matches!(thread.state, ThreadState::Ready) {
            self.remove_ready(id, old_effective);
            self.push_ready(id, new_effective);
        }
        self.reschedule(cs);
    }
}

impl<P: Port, C: Config> Default for Kernel<P, C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DefaultConfig;

    /// A `Port` with no real architecture behind it: `enter_critical` just
    /// hands back a token, `request_context_switch` only counts how often
    /// it's been asked. Enough to drive `Kernel` end to end in a host test.
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
        const MAX_RECURSIVE_LOCKS: u32 = 4;
    }

    fn noop() -> Box<dyn FnOnce() + Send> {
        Box::new(|| {})
    }

    #[test]
    fn higher_priority_thread_preempts_on_spawn() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let low = kernel.spawn(&mut cs, 1, noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(low));

        let high = kernel.spawn(&mut cs, 5, noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(high));
        assert_eq!(kernel.get_state(low), Some(ThreadState::Ready));
    }

    #[test]
    fn round_robin_siblings_rotate_once_the_quantum_expires() {
        let mut kernel = Kernel::<TestPort, FastConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let a = kernel.spawn_with(&mut cs, Builder::new(3).policy(Policy::RoundRobin), noop());
        let b = kernel.spawn_with(&mut cs, Builder::new(3).policy(Policy::RoundRobin), noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(a));

        // FastConfig's quantum is 2 ticks; the third tick must rotate `a`
        // out and `b` in, since `b` is ready at the same priority.
        kernel.on_tick(&mut cs);
        assert_eq!(kernel.current(), Some(a));
        kernel.on_tick(&mut cs);
        assert_eq!(kernel.current(), Some(b));
    }

    #[test]
    fn a_lone_round_robin_thread_never_rotates_out() {
        let mut kernel = Kernel::<TestPort, FastConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let only = kernel.spawn_with(&mut cs, Builder::new(3).policy(Policy::RoundRobin), noop());
        kernel.reschedule(&mut cs);
        for _ in 0..10 {
            kernel.on_tick(&mut cs);
        }
        assert_eq!(kernel.current(), Some(only));
    }

    #[test]
    fn exit_wakes_a_registered_joiner() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let target = kernel.spawn(&mut cs, 1, noop());
        let joiner = kernel.spawn(&mut cs, 1, noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(target));

        // Put `joiner` in the state a real `join(target)` call would have
        // left it in: parked in `Blocked`, off the ready queue, registered
        // on `target.joiner`.
        assert!(kernel.remove_ready(joiner, 1));
        kernel.thread_mut(joiner).unwrap().state = ThreadState::Blocked {
            target: WaitTarget::Join(target),
            deadline: None,
        };
        kernel.thread_mut(target).unwrap().joiner = Some(joiner);

        kernel.exit_current(&mut cs);

        // `exit_current` only wakes the joiner; reclaiming the arena slot
        // is `join`'s own job once it observes `Terminated`.
        assert_eq!(kernel.get_state(target), Some(ThreadState::Terminated));
        assert_eq!(kernel.current(), Some(joiner));
    }

    #[test]
    fn join_returns_immediately_once_the_target_already_exited() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let target = kernel.spawn(&mut cs, 1, noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(target));
        kernel.exit_current(&mut cs);
        assert_eq!(kernel.get_state(target), Some(ThreadState::Terminated));

        let joiner = kernel.spawn(&mut cs, 0, noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(joiner));
        assert_eq!(kernel.join(&mut cs, target), Ok(()));
        assert_eq!(kernel.get_state(target), None);
    }

    #[test]
    fn join_rejects_self_join() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let a = kernel.spawn(&mut cs, 1, noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.join(&mut cs, a), Err(Error::Einval));
    }

    #[test]
    #[cfg(feature = "thread-detach")]
    fn join_rejects_a_detached_target() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let _a = kernel.spawn(&mut cs, 1, noop());
        let b = kernel.spawn(&mut cs, 0, noop());
        kernel.reschedule(&mut cs);
        kernel.detach(b).unwrap();
        assert_eq!(kernel.join(&mut cs, b), Err(Error::Einval));
    }

    #[test]
    #[cfg(feature = "thread-detach")]
    fn detach_is_rejected_the_second_time() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let a = kernel.spawn(&mut cs, 1, noop());
        kernel.reschedule(&mut cs);
        kernel.detach(a).unwrap();
        assert_eq!(kernel.detach(a), Err(Error::Einval));
    }

    #[test]
    #[cfg(feature = "thread-detach")]
    fn reclaim_frees_a_terminated_detached_thread() {
        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let a = kernel.spawn(&mut cs, 1, noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(a));

        kernel.detach(a).unwrap();
        kernel.exit_current(&mut cs);
        assert_eq!(kernel.get_state(a), Some(ThreadState::Terminated));
        assert_eq!(kernel.reclaim_detached_threads(), 1);
        assert_eq!(kernel.get_state(a), None);
    }

    /// A user timer armed alongside a blocked thread's timeout must still
    /// fire when driven through the real tick hook: `on_tick` drains thread
    /// wakeups from the same heap before it services timers, and that pass
    /// must not silently swallow the due `Timer` entry along the way.
    #[test]
    fn on_tick_fires_a_due_timer_even_with_a_pending_thread_wakeup() {
        use alloc::rc::Rc;
        use core::cell::Cell;

        let mut kernel = Kernel::<TestPort, DefaultConfig>::new();
        let mut cs = CriticalSection::<TestPort>::new();

        // A low-priority thread with its own timeout, so the heap holds a
        // `ThreadWakeup` entry alongside the timer.
        let low = kernel.spawn(&mut cs, 1, noop());
        kernel.reschedule(&mut cs);
        assert_eq!(kernel.current(), Some(low));
        // Both deadlines land on the same tick (4): the thread's sleep via
        // `schedule_wakeup`, and the timer's via `arm_timer`'s `+ GUARD_TICKS`
        // (`now + 3 + 1 == 4`) — exactly the case where the two kinds shared
        // the same heap entry on the tick `drain_due_wakeups` used to drop.
        let deadline = kernel.now() + Duration::ticks(4);
        kernel
            .block_current(&mut cs, WaitTarget::Sleep, Some(deadline))
            .unwrap();

        let fired = Rc::new(Cell::new(0u32));
        let counted = fired.clone();
        let now = kernel.now();
        kernel
            .timers_mut()
            .arm_timer(now, Duration::ticks(3), None, Box::new(move || counted.set(counted.get() + 1)), 8)
            .unwrap();

        for _ in 0..3 {
            kernel.on_tick(&mut cs);
            assert_eq!(fired.get(), 0);
            assert_eq!(
                kernel.get_state(low),
                Some(ThreadState::Blocked { target: WaitTarget::Sleep, deadline: Some(deadline) })
            );
        }

        kernel.on_tick(&mut cs);
        assert_eq!(fired.get(), 1);
        assert_eq!(kernel.get_state(low), Some(ThreadState::Ready));
    }
}
