//! The software timer supervisor.
//!
//! Grounded on `r3_kernel`'s `timeout::TimeoutList`/`timer.rs` pair — a
//! single ordered list of "next fire" events serviced from the tick
//! handler — but collapsed into one list that carries both kinds of
//! deadline the kernel schedules: a blocked thread's wait timeout, and a
//! user `Timer`'s callback. Ordering and O(log n) arbitrary-position
//! removal come from [`crate::utils::binary_heap::BinaryHeap`] instead of
//! the teacher's `utils::binary_heap` over `ArrayVec`, per the same
//! `alloc`-commitment reasoning as [`crate::utils::arena`].
use alloc::boxed::Box;

use crate::critical::CriticalSection;
use crate::port::Port;
use crate::thread::ThreadId;
use crate::tick::{Duration, Tick};
use crate::utils::arena::{Arena, Handle};
use crate::utils::binary_heap::{BinaryHeap, HeapCtx};

/// The number of extra ticks a newly armed timer's deadline is pushed out
/// by, so that a timer started during the tick that is about to elapse
/// still gets at least one full period before firing. Grounded on
/// `SoftwareTimer::start`'s `now + duration + decltype(duration){1}` in the
/// original distortos sources.
pub const GUARD_TICKS: u64 = 1;

pub type TimerId = Handle;

struct Entry {
    deadline: Tick,
    heap_index: usize,
    kind: EntryKind,
}

enum EntryKind {
    ThreadWakeup(ThreadId),
    Timer {
        period: Option<Duration>,
        // `None` only while the callback is executing (see `fire_due_timers`):
        // taken out so the callback can call back into the supervisor (e.g.
        // `stop` its own timer) without reentering a live borrow of `entries`.
        callback: Option<Box<dyn FnMut() + Send>>,
        active: bool,
    },
}

#[derive(Clone, Copy)]
struct Key {
    deadline: Tick,
    slot: usize,
}

struct OrderBySlot<'a> {
    entries: &'a mut Arena<Entry>,
}

impl HeapCtx<Key> for OrderBySlot<'_> {
    fn lt(&mut self, x: &Key, y: &Key) -> bool {
        x.deadline.get() < y.deadline.get()
    }

    fn on_move(&mut self, e: &mut Key, new_index: usize) {
        if let Some(entry) = self.entries.get_mut(Handle::from_index(e.slot)) {
            entry.heap_index = new_index;
        }
    }
}

/// Owns every pending deadline: sleeping threads' timeouts and armed user
/// timers, in one fire-time-ordered structure.
pub struct Supervisor {
    entries: Arena<Entry>,
    heap: BinaryHeap<Key>,
    timer_count: usize,
}

impl Supervisor {
    pub const fn new() -> Self {
        Self {
            entries: Arena::new(),
            heap: BinaryHeap::new(),
            timer_count: 0,
        }
    }

    /// How many user timers are currently armed, for callers enforcing
    /// `Config::MAX_TIMERS`.
    pub fn timer_count(&self) -> usize {
        self.timer_count
    }

    fn ctx(&mut self) -> OrderBySlot<'_> {
        OrderBySlot {
            entries: &mut self.entries,
        }
    }

    /// Register a one-shot wakeup for a blocked thread's timeout.
    pub fn schedule_wakeup(&mut self, thread: ThreadId, deadline: Tick) {
        let slot = self.entries.insert(Entry {
            deadline,
            heap_index: 0,
            kind: EntryKind::ThreadWakeup(thread),
        });
        let key = Key {
            deadline,
            slot: slot.index(),
        };
        let index = self.heap.push(key, self.ctx());
        if let Some(entry) = self.entries.get_mut(slot) {
            entry.heap_index = index;
        }
    }

    /// Cancel a thread's pending timeout (the thread woke up some other
    /// way first). A no-op if it had none, or it already fired.
    pub fn cancel_wakeup(&mut self, thread: ThreadId) {
        let found = self.entries.iter().find_map(|(h, e)| match &e.kind {
            EntryKind::ThreadWakeup(t) if *t == thread => Some((h, e.heap_index)),
            _ => None,
        });
        if let Some((handle, heap_index)) = found {
            self.heap.remove(heap_index, self.ctx());
            self.entries.remove(handle);
        }
    }

    /// Pop every thread wakeup due at or before `now`, removing them from
    /// the supervisor. A due `Timer` entry is left in place for
    /// [`Self::fire_due_timers`] to service instead of being dropped: it is
    /// popped off the heap to inspect its kind, then re-pushed unless it
    /// turns out to be a thread wakeup.
    pub fn drain_due_wakeups(&mut self, now: Tick) -> alloc::vec::Vec<ThreadId> {
        let mut due = alloc::vec::Vec::new();
        let mut requeue = alloc::vec::Vec::new();
        while let Some(key) = self.heap.peek() {
            if key.deadline.get() > now.get() {
                break;
            }
            let key = self.heap.pop(self.ctx()).unwrap();
            let handle = Handle::from_index(key.slot);
            match self.entries.get(handle).map(|e| &e.kind) {
                Some(EntryKind::ThreadWakeup(thread)) => {
                    let thread = *thread;
                    self.entries.remove(handle);
                    due.push(thread);
                }
                _ => requeue.push(key),
            }
        }
        for key in requeue {
            let handle = Handle::from_index(key.slot);
            let index = self.heap.push(key, self.ctx());
            if let Some(entry) = self.entries.get_mut(handle) {
                entry.heap_index = index;
            }
        }
        due
    }

    /// Arm a user timer, grounded on `Timer::start`: `period` of `None`
    /// makes it one-shot. `max_timers` is `Config::MAX_TIMERS`; exceeding it
    /// returns [`crate::error::Error::Eagain`].
    pub fn arm_timer(
        &mut self,
        now: Tick,
        delay: Duration,
        period: Option<Duration>,
        callback: Box<dyn FnMut() + Send>,
        max_timers: usize,
    ) -> Result<TimerId, crate::error::Error> {
        if self.timer_count >= max_timers {
            return Err(crate::error::Error::Eagain);
        }
        let deadline = now + delay + Duration::ticks(GUARD_TICKS);
        let slot = self.entries.insert(Entry {
            deadline,
            heap_index: 0,
            kind: EntryKind::Timer {
                period,
                callback: Some(callback),
                active: true,
            },
        });
        let key = Key {
            deadline,
            slot: slot.index(),
        };
        let index = self.heap.push(key, self.ctx());
        if let Some(entry) = self.entries.get_mut(slot) {
            entry.heap_index = index;
        }
        self.timer_count += 1;
        Ok(slot)
    }

    /// Disarm a timer. A no-op if `id` is unknown or already disarmed.
    pub fn disarm_timer(&mut self, id: TimerId) {
        let was_timer = matches!(self.entries.get(id).map(|e| &e.kind), Some(EntryKind::Timer { .. }));
        if let Some(entry) = self.entries.get_mut(id) {
            if let EntryKind::Timer { active, .. } = &mut entry.kind {
                *active = false;
            }
        }
        let heap_index = self.entries.get(id).map(|e| e.heap_index);
        if let Some(heap_index) = heap_index {
            self.heap.remove(heap_index, self.ctx());
        }
        self.entries.remove(id);
        if was_timer {
            self.timer_count -= 1;
        }
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        matches!(
            self.entries.get(id).map(|e| &e.kind),
            Some(EntryKind::Timer { active: true, .. })
        )
    }

    /// Run every timer callback due at or before `now`, re-arming periodic
    /// ones for their next period. Runs with the kernel's critical section
    /// already held by the caller (the tick handler), matching
    /// `r3_kernel`'s timer callbacks, which also run at tick-interrupt
    /// priority.
    ///
    /// A periodic timer keeps the same [`TimerId`] across every firing: it
    /// is re-armed in the heap *before* its callback runs (keyed off its own
    /// scheduled deadline, not `now`, so drift never accumulates from how
    /// long a callback takes), so a callback that calls [`Self::disarm_timer`]
    /// on its own id — the common "stop myself" pattern — actually cancels
    /// the next firing instead of racing a reinsertion that happens after it
    /// returns.
    pub fn fire_due_timers<P: Port>(&mut self, now: Tick, _cs: &mut CriticalSection<P>) {
        loop {
            let Some(key) = self.heap.peek() else { break };
            if key.deadline.get() > now.get() {
                break;
            }
            let Key { slot, .. } = self.heap.pop(self.ctx()).unwrap();
            let handle = Handle::from_index(slot);

            let scheduled_deadline = match self.entries.get(handle) {
                Some(entry) => entry.deadline,
                None => continue,
            };
            if scheduled_deadline.get() < now.get() {
                log::warn!(
                    "timer {:?} overran its own period: scheduled for {:?}, serviced at {:?}",
                    handle,
                    scheduled_deadline,
                    now
                );
            }

            let (period, active) = match self.entries.get(handle).map(|e| &e.kind) {
                Some(EntryKind::Timer { period, active, .. }) => (*period, *active),
                _ => {
                    // A thread-wakeup entry has no business reaching this
                    // heap (those are drained by `drain_due_wakeups`); drop
                    // it defensively rather than leaking the arena slot.
                    self.entries.remove(handle);
                    continue;
                }
            };

            if !active {
                self.entries.remove(handle);
                self.timer_count -= 1;
                continue;
            }

            // Extract the callback before touching the entry's lifetime:
            // for a one-shot timer the entry is about to be removed
            // entirely, but the callback itself must still run.
            let callback = match self.entries.get_mut(handle) {
                Some(entry) => match &mut entry.kind {
                    EntryKind::Timer { callback, .. } => callback.take(),
                    _ => None,
                },
                None => None,
            };
            let Some(mut callback) = callback else { continue };

            if let Some(period) = period {
                let deadline = scheduled_deadline + period;
                if let Some(entry) = self.entries.get_mut(handle) {
                    entry.deadline = deadline;
                }
                let key = Key {
                    deadline,
                    slot: handle.index(),
                };
                let index = self.heap.push(key, self.ctx());
                if let Some(entry) = self.entries.get_mut(handle) {
                    entry.heap_index = index;
                }
            } else {
                self.entries.remove(handle);
                self.timer_count -= 1;
            }

            log::debug!("timer {:?} fired at {:?}", handle, now);
            callback();

            // Put the callback back only if the entry (i.e. this exact
            // firing's re-armed slot) still exists — a `stop()` issued from
            // inside the callback already removed it.
            if let Some(entry) = self.entries.get_mut(handle) {
                if let EntryKind::Timer { callback: slot, .. } = &mut entry.kind {
                    *slot = Some(callback);
                }
            }
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::rc::Rc;
    use core::cell::Cell;

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

    #[test]
    fn one_shot_timer_fires_once_and_is_then_gone() {
        let mut sup = Supervisor::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let fired = Rc::new(Cell::new(0u32));
        let counted = fired.clone();

        let id = sup
            .arm_timer(Tick(0), Duration::ticks(5), None, Box::new(move || counted.set(counted.get() + 1)), 8)
            .unwrap();
        assert!(sup.is_armed(id));
        assert_eq!(sup.timer_count(), 1);

        // Deadline is `now + delay + GUARD_TICKS`, so it must not fire one
        // tick early.
        sup.fire_due_timers(Tick(5), &mut cs);
        assert_eq!(fired.get(), 0);

        sup.fire_due_timers(Tick(6), &mut cs);
        assert_eq!(fired.get(), 1);
        assert!(!sup.is_armed(id));
        assert_eq!(sup.timer_count(), 0);

        // Firing again past the same deadline is a no-op; the entry is gone.
        sup.fire_due_timers(Tick(100), &mut cs);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn periodic_timer_keeps_the_same_id_and_does_not_drift() {
        let mut sup = Supervisor::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let fired = Rc::new(Cell::new(0u32));
        let counted = fired.clone();

        let id = sup
            .arm_timer(
                Tick(0),
                Duration::ticks(10),
                Some(Duration::ticks(10)),
                Box::new(move || counted.set(counted.get() + 1)),
                8,
            )
            .unwrap();
        let first_deadline = Tick(0) + Duration::ticks(10) + Duration::ticks(GUARD_TICKS);

        sup.fire_due_timers(first_deadline, &mut cs);
        assert_eq!(fired.get(), 1);
        assert!(sup.is_armed(id));
        assert_eq!(sup.timer_count(), 1);

        // The next deadline is keyed off the *scheduled* deadline, not the
        // tick it actually ran at, so it lands exactly one period later
        // regardless of how late this call serviced it.
        let second_deadline = first_deadline + Duration::ticks(10);
        sup.fire_due_timers(Tick(second_deadline.get() + 3), &mut cs);
        assert_eq!(fired.get(), 2);
        assert!(sup.is_armed(id));

        sup.fire_due_timers(second_deadline + Duration::ticks(10), &mut cs);
        assert_eq!(fired.get(), 3);
        assert_eq!(sup.timer_count(), 1);
    }

    #[test]
    fn disarm_prevents_a_pending_firing() {
        let mut sup = Supervisor::new();
        let mut cs = CriticalSection::<TestPort>::new();
        let fired = Rc::new(Cell::new(0u32));
        let counted = fired.clone();

        let id = sup
            .arm_timer(Tick(0), Duration::ticks(1), None, Box::new(move || counted.set(counted.get() + 1)), 8)
            .unwrap();
        sup.disarm_timer(id);
        assert!(!sup.is_armed(id));
        assert_eq!(sup.timer_count(), 0);

        sup.fire_due_timers(Tick(50), &mut cs);
        assert_eq!(fired.get(), 0);

        // A second disarm of the same (already-gone) id is a no-op, not a
        // panic or a double-decrement of `timer_count`.
        sup.disarm_timer(id);
        assert_eq!(sup.timer_count(), 0);
    }

    #[test]
    fn arm_timer_is_rejected_once_the_cap_is_reached() {
        let mut sup = Supervisor::new();
        sup.arm_timer(Tick(0), Duration::ticks(1), None, Box::new(|| {}), 1).unwrap();
        assert_eq!(
            sup.arm_timer(Tick(0), Duration::ticks(1), None, Box::new(|| {}), 1)
                .err(),
            Some(crate::error::Error::Eagain)
        );
    }

    #[test]
    fn schedule_wakeup_drains_at_or_before_the_deadline() {
        let mut sup = Supervisor::new();
        let thread = ThreadId::from_index(0);
        sup.schedule_wakeup(thread, Tick(10));
        assert!(sup.drain_due_wakeups(Tick(9)).is_empty());
        assert_eq!(sup.drain_due_wakeups(Tick(10)), alloc::vec![thread]);
        // Already drained; nothing left to fire twice.
        assert!(sup.drain_due_wakeups(Tick(20)).is_empty());
    }

    #[test]
    fn cancel_wakeup_is_a_no_op_once_already_fired() {
        let mut sup = Supervisor::new();
        let thread = ThreadId::from_index(0);
        sup.schedule_wakeup(thread, Tick(10));
        sup.cancel_wakeup(thread);
        assert!(sup.drain_due_wakeups(Tick(10)).is_empty());
    }
}
