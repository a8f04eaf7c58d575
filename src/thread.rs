//! Thread control blocks.
//!
//! Grounded on `r3_kernel`'s `task::TaskCb` (base/effective priority fields,
//! `TaskSt` state machine) and `task/readyqueue.rs` (FIFO-within-priority
//! ready ordering), reshaped per the design notes: a `TaskCb` lives forever
//! at a fixed `&'static` address in the teacher; here a [`Thread`] lives in
//! the kernel's [`crate::utils::arena::Arena`] and is addressed by the stable
//! [`ThreadId`] handle instead, and its entry point is a boxed closure
//! (`alloc::boxed::Box<dyn FnOnce()>`) rather than a raw `fn` pointer plus a
//! `usize` argument.
use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::error::UnblockReason;
use crate::tick::Tick;
use crate::utils::arena::Handle;

/// A thread, addressed by its stable arena slot.
pub type ThreadId = Handle;

/// What a blocked thread is waiting for, recorded so the scheduler's tick
/// handler and the owning object agree on how to wake it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    Mutex(Handle),
    Semaphore(Handle),
    Condvar(Handle),
    /// `Queue`/`ByteQueue` don't need their handle recorded here: unlike
    /// mutexes, nothing ever has to walk back from a blocked thread to the
    /// queue it's waiting on (there's no inheritance chain to propagate).
    Queue,
    #[cfg(feature = "signals")]
    Signal,
    /// `sleep_for`/`sleep_until`: nothing owns the wait but the timeout.
    Sleep,
    /// `join()`: nothing owns the wait but the target thread's own exit,
    /// recorded on the target's `joiner` field rather than a shared
    /// wait-list object: at most one joiner can ever be registered.
    Join(ThreadId),
}

/// A thread's run state. Matches `r3_kernel::task::TaskSt`'s cases apart from
/// `Dormant`, which this crate folds into "not yet present in the arena" —
/// a thread is only ever inserted once it's ready to run; there is no
/// separate pre-activation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    /// Blocked on `target`, optionally with a wakeup deadline for a timed
    /// wait. `Sleep`'s deadline is always `Some`.
    Blocked {
        target: WaitTarget,
        deadline: Option<Tick>,
    },
    /// The entry function has returned. Retained in the arena until either a
    /// joiner observes it (via [`crate::scheduler::Kernel::join`]) or, if
    /// the thread was already detached, until the idle-thread reclamation
    /// path removes it.
    Terminated,
}

/// Whether a thread competes for the CPU strictly FIFO-within-priority, or
/// round-robins with equal-priority siblings on a fixed tick quantum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Fifo,
    RoundRobin,
}

/// A thread's stack, retained only so [`Thread::stack_high_water_mark`] can
/// report how close to overflow the thread has ever come. Filled with a
/// fixed canary byte at creation (grounded on distortos's
/// `getStackHighWaterMark`, which scans from the lowest address for the
/// first byte that's no longer the fill pattern); this crate never reads or
/// writes the stack for any other purpose; the actual context save/restore
/// that consumes it is the architecture port's job, out of scope here.
pub struct Stack {
    memory: Box<[u8]>,
}

const STACK_CANARY: u8 = 0xA5;

impl Stack {
    /// Allocate and canary-fill `size` bytes of stack storage.
    pub fn new(size: usize) -> Self {
        Self {
            memory: alloc::vec![STACK_CANARY; size].into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// How many bytes, counted from the lowest address, have ever been
    /// written by the thread that owns this stack (i.e. no longer read back
    /// as the canary fill byte). `0` if the thread never ran deep enough to
    /// disturb even the first word — callers still holding `stack` from the
    /// port's perspective would normally only read this after the thread has
    /// run at least once.
    pub fn high_water_mark(&self) -> usize {
        let untouched = self.memory.iter().rev().take_while(|&&b| b == STACK_CANARY).count();
        self.memory.len() - untouched
    }
}

/// A thread control block.
pub struct Thread {
    pub id: ThreadId,
    /// The priority this thread was created or last `set_priority`d with.
    pub base_priority: u8,
    /// The priority actually used for scheduling: `base_priority` boosted by
    /// priority inheritance from mutexes this thread holds.
    pub effective_priority: u8,
    pub policy: Policy,
    /// Ticks remaining in this thread's current round-robin slice. Only
    /// meaningful for `Policy::RoundRobin`; reloaded from
    /// `Config::ROUND_ROBIN_QUANTUM_TICKS` whenever the thread starts a
    /// fresh turn at the head of its priority list.
    pub round_robin_remaining: u32,
    pub state: ThreadState,
    /// The thread's body. Taken (leaving `None`) the moment the scheduler
    /// dispatches it for the first time; a thread is never re-entered once
    /// started, so a second dispatch never observes `Some` again.
    pub entry: Option<Box<dyn FnOnce() + Send>>,
    /// Mutexes currently owned by this thread, most-recently-locked last.
    /// Consulted when recomputing `effective_priority` after a priority
    /// change or an unlock.
    pub owned_mutexes: Vec<Handle>,
    #[cfg(feature = "signals")]
    pub signals: crate::signal::SignalContext,
    /// Why this thread most recently left `Blocked`, stashed by
    /// [`crate::scheduler::Kernel::unblock`] for
    /// [`crate::scheduler::Kernel::block_current`] to hand back to its
    /// caller once the thread resumes.
    pub last_unblock_reason: UnblockReason,
    /// `true` once `detach()` has been called; `join()` on a detached
    /// thread always fails.
    pub detached: bool,
    /// The single thread blocked in `join()` on this one, if any — a thread
    /// may only ever be joined by one caller at a time, so this is a single
    /// slot rather than a `WaitQueue`.
    pub joiner: Option<ThreadId>,
    pub stack: Option<Stack>,
    _not_send_sync: core::marker::PhantomData<*const ()>,
}

impl Thread {
    /// `queued_signal_capacity` is ignored unless the `signals` feature is
    /// enabled, in which case it sizes this thread's queued-signal ring.
    pub fn new(
        id: ThreadId,
        priority: u8,
        policy: Policy,
        entry: Box<dyn FnOnce() + Send>,
        stack: Option<Stack>,
        #[allow(unused_variables)] queued_signal_capacity: usize,
        #[allow(unused_variables)] signals_enabled: bool,
    ) -> Self {
        Self {
            id,
            base_priority: priority,
            effective_priority: priority,
            policy,
            round_robin_remaining: 0,
            state: ThreadState::Ready,
            entry: Some(entry),
            owned_mutexes: Vec::new(),
            #[cfg(feature = "signals")]
            signals: crate::signal::SignalContext::new(queued_signal_capacity, signals_enabled),
            last_unblock_reason: UnblockReason::Normal,
            detached: false,
            joiner: None,
            stack,
            _not_send_sync: core::marker::PhantomData,
        }
    }

    #[inline]
    pub fn is_blocked_on(&self, target: WaitTarget) -> bool {
        matches!(self.state, ThreadState::Blocked { target: t, .. } if t == target)
    }

    #[inline]
    pub fn effective_priority(&self) -> u8 {
        self.effective_priority
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// `None` for a thread created without a tracked [`Stack`] — stack
    /// ownership for arch-integrated threads is the host application's
    /// concern, not every thread this crate schedules need supply one.
    pub fn stack_high_water_mark(&self) -> Option<usize> {
        self.stack.as_ref().map(Stack::high_water_mark)
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("base_priority", &self.base_priority)
            .field("effective_priority", &self.effective_priority)
            .field("policy", &self.policy)
            .field("state", &self.state)
            .field("detached", &self.detached)
            .finish_non_exhaustive()
    }
}

/// Builder for a new thread, matching `r3_kernel`'s convention of a small
/// fluent configuration object ahead of activation, collapsed here from the
/// teacher's const-generic `CfgBuilder` (which wires a task into the
/// `build!`-macro object table at compile time) to a runtime builder, since
/// this crate's threads live in a dynamic [`crate::utils::arena::Arena`]
/// rather than a `build!`-generated static table.
pub struct Builder {
    priority: u8,
    policy: Policy,
    stack: Option<Stack>,
    /// Ignored unless the `signals` feature is enabled.
    queued_signal_capacity: usize,
    /// Ignored unless the `signals` feature is enabled. Fixed at creation
    /// time; there is no API to flip it later.
    signals_enabled: bool,
}

impl Builder {
    pub fn new(priority: u8) -> Self {
        Self {
            priority,
            policy: Policy::Fifo,
            stack: None,
            queued_signal_capacity: 0,
            signals_enabled: true,
        }
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Track a canary-filled stack of `size` bytes so
    /// [`Thread::stack_high_water_mark`] reports something other than
    /// `None` for this thread.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack = Some(Stack::new(size));
        self
    }

    /// Capacity of this thread's queued-signal ring, chosen at thread
    /// creation. Ignored if the `signals` feature is disabled.
    #[cfg(feature = "signals")]
    pub fn queued_signal_capacity(mut self, n: usize) -> Self {
        self.queued_signal_capacity = n;
        self
    }

    /// Create this thread with signal reception permanently disabled: every
    /// `generate_signal`/`queue_signal` targeting it, and every
    /// `this_thread::wait`/`try_wait` it issues, fails `Enotsup`. This is a
    /// creation-time-only switch; there is no call to flip it back on.
    #[cfg(feature = "signals")]
    pub fn disable_signal_reception(mut self) -> Self {
        self.signals_enabled = false;
        self
    }

    /// Create the thread in the owning [`crate::scheduler::Kernel`] and make
    /// it eligible for scheduling. See
    /// [`crate::scheduler::Kernel::spawn_with`].
    pub fn spawn<P: crate::port::Port, C: crate::config::Config>(
        self,
        kernel: &mut crate::scheduler::Kernel<P, C>,
        cs: &mut crate::critical::CriticalSection<P>,
        entry: Box<dyn FnOnce() + Send>,
    ) -> ThreadId {
        kernel.spawn_with(cs, self, entry)
    }

    pub(crate) fn into_thread(self, id: ThreadId, entry: Box<dyn FnOnce() + Send>) -> Thread {
        Thread::new(
            id,
            self.priority,
            self.policy,
            entry,
            self.stack,
            self.queued_signal_capacity,
            self.signals_enabled,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_stack_reports_zero_high_water_mark() {
        let stack = Stack::new(256);
        assert_eq!(stack.high_water_mark(), 0);
    }

    #[test]
    fn writes_from_the_low_end_are_detected() {
        let mut stack = Stack::new(256);
        stack.memory[..64].fill(0);
        assert_eq!(stack.high_water_mark(), 192);
    }
}
