//! A POSIX-flavoured signal subsystem (§4.8), gated behind the `signals`
//! feature.
//!
//! `r3_kernel` has no signal facility of its own; grounded instead on its
//! `event_group.rs` pattern for a per-object flag set (`bitflags`-backed,
//! waiters matching against a mask) for [`SignalActionFlags`], and on
//! `wait.rs`'s block/unblock pattern for [`SignalContext::wait`]. Signal
//! number 0..31 is fixed at 32 slots addressed directly by signal number,
//! rather than the "M slots chosen at thread-creation time" shape the
//! distilled spec leaves open (recorded as an Open Question decision in
//! `DESIGN.md`): a flat `[Option<SignalAction>; 32]` array is simpler to
//! reason about than a per-thread sized allocation, and 32 covers every
//! signal number this crate defines.
use alloc::boxed::Box;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::config::Config;
use crate::critical::CriticalSection;
use crate::error::{Error, UnblockReason};
use crate::port::Port;
use crate::scheduler::Kernel;
use crate::thread::{ThreadId, ThreadState, WaitTarget};
use crate::tick::Duration;

pub const NSIG: usize = 32;

bitflags! {
    /// Disposition flags attached to a [`SignalAction`], mirroring the
    /// handful of flags POSIX `sigaction` supports that matter without an
    /// MMU or process model: whether delivering this signal again while its
    /// own handler is running re-enters immediately or stays masked.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SignalActionFlags: u32 {
        /// Don't add this signal to its own mask while its handler runs.
        const NODEFER = 1 << 0;
    }
}

/// A bitset over signal numbers `0..NSIG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalSet(u32);

impl SignalSet {
    pub const EMPTY: Self = Self(0);

    pub const fn single(signo: u8) -> Self {
        Self(1 << signo)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, signo: u8) {
        self.0 |= 1 << signo;
    }

    pub fn remove(&mut self, signo: u8) {
        self.0 &= !(1 << signo);
    }

    pub fn contains(self, signo: u8) -> bool {
        self.0 & (1 << signo) != 0
    }

    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// The lowest-numbered signal set in both `self` and `unmasked`
    /// (`!mask`), if any — the one `wait` delivers first.
    pub fn lowest_unmasked(self, mask: SignalSet) -> Option<u8> {
        let deliverable = self.0 & !mask.0;
        if deliverable == 0 {
            None
        } else {
            Some(deliverable.trailing_zeros() as u8)
        }
    }
}

pub struct SignalAction {
    pub handler: Box<dyn FnMut(SignalInfo) + Send>,
    pub flags: SignalActionFlags,
    /// Extra signals to mask for the duration of this handler, beyond the
    /// signal being delivered itself (§4.8: `catch(handler, extra_mask)`).
    pub extra_mask: SignalSet,
}

/// Whether a delivered signal arrived as a bare [`generate_signal`] instance
/// or a [`queue_signal`] instance carrying a payload (§4.8's "code" field —
/// generated and queued instances of the same signal number otherwise share
/// one pending bit, so this is the only way a handler or waiter can tell
/// which one it just received).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryCode {
    Generated,
    Queued,
}

/// The record handed to a catch handler, or returned by [`wait`]/[`try_wait`]:
/// which signal fired, its payload (`0` for a bare generated instance), and
/// whether it arrived generated or queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    pub signo: u8,
    pub value: u32,
    pub code: DeliveryCode,
}

/// One queued instance of a signal carrying a payload, for signal numbers
/// delivered via `queue_signal` rather than `generate_signal` (POSIX
/// realtime signals' "may be queued more than once" behavior, §4.8).
struct QueuedSignal {
    signo: u8,
    value: u32,
}

/// Per-thread signal state: which signals are pending, which are masked,
/// the fixed action table, and any realtime-style queued payloads.
pub struct SignalContext {
    pending: SignalSet,
    mask: SignalSet,
    actions: [Option<SignalAction>; NSIG],
    queued: Vec<QueuedSignal>,
    /// Masks saved by nested signal delivery, restored in LIFO order as
    /// each handler invocation completes (§4.8's nested-delivery rule).
    saved_masks: Vec<SignalSet>,
    /// Upper bound on `queued.len()`, chosen at thread creation (§7:
    /// `Config::MAIN_THREAD_QUEUED_SIGNALS`, or `Builder::queued_signal_capacity`
    /// for other threads). `queue` past this returns `Eagain`.
    queue_capacity: usize,
    /// Whether this thread accepts signals at all, fixed at thread creation
    /// (§9: "treat it as creation-time only", no runtime API re-enables it).
    /// `false` makes every generate/queue/wait call targeting or issued from
    /// this thread fail `Enotsup` (§4.8, §7).
    enabled: bool,
}

impl SignalContext {
    pub fn new(queue_capacity: usize, enabled: bool) -> Self {
        Self {
            pending: SignalSet::EMPTY,
            mask: SignalSet::EMPTY,
            actions: core::array::from_fn(|_| None),
            queued: Vec::new(),
            saved_masks: Vec::new(),
            queue_capacity,
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Mark `signo` pending, coalescing with any already-pending instance
    /// (`generate_signal`: at most one instance outstanding per number).
    pub fn generate(&mut self, signo: u8) -> Result<(), Error> {
        if signo as usize >= NSIG {
            return Err(Error::Einval);
        }
        self.pending.insert(signo);
        Ok(())
    }

    /// Queue a realtime-style instance of `signo` carrying `value`, never
    /// coalescing with other queued instances of the same number.
    pub fn queue(&mut self, signo: u8, value: u32) -> Result<(), Error> {
        if signo as usize >= NSIG {
            return Err(Error::Einval);
        }
        if self.queued.len() >= self.queue_capacity {
            return Err(Error::Eagain);
        }
        self.pending.insert(signo);
        self.queued.push(QueuedSignal { signo, value });
        Ok(())
    }

    /// Install `action` for `signo`, returning whatever action it replaces
    /// (`set_signal_action`, §4.8). A `None` action is the `SIG_IGN`-style
    /// default: the signal still becomes pending as usual, it just has no
    /// handler to dispatch, so it sits there until an explicit `wait`/
    /// `try_wait` accepts it.
    pub fn set_action(&mut self, signo: u8, action: Option<SignalAction>) -> Result<Option<SignalAction>, Error> {
        let slot = self.actions.get_mut(signo as usize).ok_or(Error::Einval)?;
        Ok(core::mem::replace(slot, action))
    }

    pub fn set_mask(&mut self, mask: SignalSet) -> SignalSet {
        core::mem::replace(&mut self.mask, mask)
    }

    pub fn mask(&self) -> SignalSet {
        self.mask
    }

    pub fn pending(&self) -> SignalSet {
        self.pending
    }

    /// The lowest-numbered pending, unmasked signal, if any — what `wait`
    /// and `try_wait` both look for, the only difference being whether the
    /// caller blocks when there isn't one.
    pub fn next_deliverable(&self) -> Option<u8> {
        self.pending.lowest_unmasked(self.mask)
    }

    /// Take delivery of `signo`: clear it from `pending`, pop its queued
    /// payload if any (a queued instance is consumed before the generated
    /// bit, per §4.8's delivery-ordering rule for coexisting instances), and
    /// install the handler-visible mask `current_mask ∪ {signo} ∪ extra_mask`
    /// (§4.8), saving the prior mask for [`Self::end_delivery`] to restore.
    /// `signo` itself is left out of the union if the action's `NODEFER`
    /// flag is set.
    pub fn take_delivery(&mut self, signo: u8) -> SignalInfo {
        self.pending.remove(signo);
        let (value, code) = if let Some(i) = self.queued.iter().position(|q| q.signo == signo) {
            (self.queued.remove(i).value, DeliveryCode::Queued)
        } else {
            (0, DeliveryCode::Generated)
        };
        let action = self.actions.get(signo as usize).and_then(|a| a.as_ref());
        let nodefer = action.map(|a| a.flags.contains(SignalActionFlags::NODEFER)).unwrap_or(false);
        let extra_mask = action.map(|a| a.extra_mask).unwrap_or(SignalSet::EMPTY);
        self.saved_masks.push(self.mask);
        if !nodefer {
            self.mask.insert(signo);
        }
        self.mask = self.mask.union(extra_mask);
        SignalInfo { signo, value, code }
    }

    /// Restore the mask saved by the matching `take_delivery`, undoing its
    /// `NODEFER`-driven mask change once the handler returns.
    pub fn end_delivery(&mut self) {
        if let Some(mask) = self.saved_masks.pop() {
            self.mask = mask;
        }
    }

    /// Whether `signo` has a catch handler installed (as opposed to the
    /// `SIG_IGN`-style default).
    pub fn has_catch(&self, signo: u8) -> bool {
        matches!(self.actions.get(signo as usize), Some(Some(_)))
    }

    /// Run the action installed for `info.signo`, if any, passing it `info`.
    /// A no-op for a signal whose action is still the default — the caller
    /// is expected to have checked [`Self::has_catch`] and left the signal
    /// pending for an explicit `wait`/`try_wait` instead.
    pub fn dispatch(&mut self, info: SignalInfo) {
        if let Some(action) = self.actions.get_mut(info.signo as usize).and_then(|a| a.as_mut()) {
            (action.handler)(info);
        }
    }
}

/// Deliver `signo` to `target` (`generate_signal`, §4.8): set it pending and,
/// if `target` is blocked in [`wait`] or [`try_wait`]... only the former
/// needs readying, since `try_wait` never blocks.
pub fn generate_signal<P: Port, C: Config>(
    kernel: &mut Kernel<P, C>,
    cs: &mut CriticalSection<P>,
    target: ThreadId,
    signo: u8,
) -> Result<(), Error> {
    deliver(kernel, cs, target, signo, |ctx| ctx.generate(signo))
}

/// Deliver a realtime-style instance of `signo` carrying `value`
/// (`queue_signal`, §4.8).
pub fn queue_signal<P: Port, C: Config>(
    kernel: &mut Kernel<P, C>,
    cs: &mut CriticalSection<P>,
    target: ThreadId,
    signo: u8,
    value: u32,
) -> Result<(), Error> {
    deliver(kernel, cs, target, signo, |ctx| ctx.queue(signo, value))
}

fn deliver<P: Port, C: Config>(
    kernel: &mut Kernel<P, C>,
    cs: &mut CriticalSection<P>,
    target: ThreadId,
    signo: u8,
    mark_pending: impl FnOnce(&mut SignalContext) -> Result<(), Error>,
) -> Result<(), Error> {
    let thread = kernel.thread_mut(target).ok_or(Error::Einval)?;
    if !thread.signals.is_enabled() {
        return Err(Error::Enotsup);
    }
    mark_pending(&mut thread.signals)?;

    let waiting_on_signal = matches!(
        thread.state,
        ThreadState::Blocked {
            target: WaitTarget::Signal,
            ..
        }
    );
    if waiting_on_signal {
        kernel.unblock(cs, target, UnblockReason::UnblockedBySignal);
    }
    Ok(())
}

/// Block the calling thread until it has a deliverable (pending and
/// unmasked) signal, then take delivery of the lowest-numbered one and
/// return its signal-information record (`this_thread::wait`, §4.8).
pub fn wait<P: Port, C: Config>(
    kernel: &mut Kernel<P, C>,
    cs: &mut CriticalSection<P>,
    timeout: Option<Duration>,
) -> Result<SignalInfo, Error> {
    let current = kernel.current().ok_or(Error::Eperm)?;

    if !kernel.thread(current).ok_or(Error::Einval)?.signals.is_enabled() {
        return Err(Error::Enotsup);
    }

    if let Some(signo) = kernel.thread(current).ok_or(Error::Einval)?.signals.next_deliverable() {
        return Ok(take(kernel, current, signo));
    }

    let deadline = timeout.map(|d| kernel.now() + d);
    let reason = kernel.block_current(cs, WaitTarget::Signal, deadline)?;
    match reason {
        UnblockReason::TimedOut => Err(Error::Etimedout),
        _ => {
            let signo = kernel
                .thread(current)
                .ok_or(Error::Einval)?
                .signals
                .next_deliverable()
                .ok_or(Error::Eagain)?;
            Ok(take(kernel, current, signo))
        }
    }
}

/// Take delivery of a pending signal without blocking; [`Error::Eagain`] if
/// there isn't one deliverable right now.
pub fn try_wait<P: Port, C: Config>(
    kernel: &mut Kernel<P, C>,
    current: ThreadId,
) -> Result<SignalInfo, Error> {
    let thread = kernel.thread(current).ok_or(Error::Einval)?;
    if !thread.signals.is_enabled() {
        return Err(Error::Enotsup);
    }
    let signo = thread.signals.next_deliverable().ok_or(Error::Eagain)?;
    Ok(take(kernel, current, signo))
}

/// Install `action` for `signo` on the calling thread, returning whatever
/// action it replaces (`set_signal_action`, §4.8).
pub fn set_signal_action<P: Port, C: Config>(
    kernel: &mut Kernel<P, C>,
    signo: u8,
    action: Option<SignalAction>,
) -> Result<Option<SignalAction>, Error> {
    let current = kernel.current().ok_or(Error::Eperm)?;
    let thread = kernel.thread_mut(current).ok_or(Error::Einval)?;
    if !thread.signals.is_enabled() {
        return Err(Error::Enotsup);
    }
    thread.signals.set_action(signo, action)
}

/// Replace the calling thread's signal mask, returning the previous one. If
/// this unmasks a signal that's both pending and has a catch handler
/// installed, dispatch it before returning (§4.8: "if any newly-unmasked
/// signal is pending, deliver it before returning"); a signal still on its
/// default action is left pending for an explicit `wait`/`try_wait` instead,
/// since there is no handler to run. Loops in case dispatching one handler's
/// `NODEFER`/mask changes make a further signal deliverable.
pub fn set_signal_mask<P: Port, C: Config>(
    kernel: &mut Kernel<P, C>,
    mask: SignalSet,
) -> Result<SignalSet, Error> {
    let current = kernel.current().ok_or(Error::Eperm)?;
    let thread = kernel.thread_mut(current).ok_or(Error::Einval)?;
    if !thread.signals.is_enabled() {
        return Err(Error::Enotsup);
    }
    let previous = thread.signals.set_mask(mask);

    loop {
        let Some(thread) = kernel.thread_mut(current) else { break };
        let Some(signo) = thread.signals.next_deliverable() else {
            break;
        };
        if !thread.signals.has_catch(signo) {
            break;
        }
        let info = thread.signals.take_delivery(signo);
        thread.signals.dispatch(info);
        if let Some(thread) = kernel.thread_mut(current) {
            thread.signals.end_delivery();
        }
    }
    Ok(previous)
}

fn take<P: Port, C: Config>(kernel: &mut Kernel<P, C>, thread: ThreadId, signo: u8) -> SignalInfo {
    kernel
        .thread_mut(thread)
        .map(|t| t.signals.take_delivery(signo))
        .unwrap_or(SignalInfo {
            signo,
            value: 0,
            code: DeliveryCode::Generated,
        })
}

impl Default for SignalContext {
    fn default() -> Self {
        Self::new(0, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_unmasked_skips_masked_signals() {
        let mut set = SignalSet::EMPTY;
        set.insert(5);
        set.insert(2);
        let mut mask = SignalSet::EMPTY;
        mask.insert(2);
        assert_eq!(set.lowest_unmasked(mask), Some(5));
    }

    #[test]
    fn generate_coalesces_repeated_signals() {
        let mut ctx = SignalContext::new(4, true);
        ctx.generate(3).unwrap();
        ctx.generate(3).unwrap();
        assert!(ctx.pending().contains(3));
        assert_eq!(ctx.take_delivery(3).value, 0);
        assert!(!ctx.pending().contains(3));
    }

    #[test]
    fn queue_preserves_each_payload() {
        let mut ctx = SignalContext::new(4, true);
        ctx.queue(7, 10).unwrap();
        ctx.queue(7, 20).unwrap();
        assert_eq!(ctx.take_delivery(7).value, 10);
        // Second instance is still queued even though `pending` only ever
        // tracked signal 7 as a single bit.
        assert_eq!(ctx.queued.len(), 1);
    }

    #[test]
    fn queue_rejects_once_capacity_is_reached() {
        let mut ctx = SignalContext::new(2, true);
        ctx.queue(7, 1).unwrap();
        ctx.queue(7, 2).unwrap();
        assert_eq!(ctx.queue(7, 3), Err(Error::Eagain));
    }

    #[test]
    fn nested_delivery_restores_the_outer_mask() {
        let mut ctx = SignalContext::new(4, true);
        let mut outer_mask = SignalSet::EMPTY;
        outer_mask.insert(9);
        ctx.set_mask(outer_mask);
        ctx.generate(1).unwrap();
        ctx.take_delivery(1);
        assert!(ctx.mask().contains(1));
        ctx.end_delivery();
        assert!(!ctx.mask().contains(1));
        assert!(ctx.mask().contains(9));
    }

    #[test]
    fn extra_mask_is_applied_for_the_handlers_duration() {
        let mut ctx = SignalContext::new(4, true);
        let mut extra = SignalSet::EMPTY;
        extra.insert(10);
        ctx.set_action(
            5,
            Some(SignalAction {
                handler: Box::new(|_| {}),
                flags: SignalActionFlags::empty(),
                extra_mask: extra,
            }),
        )
        .unwrap();
        ctx.generate(5).unwrap();
        ctx.take_delivery(5);
        assert!(ctx.mask().contains(5));
        assert!(ctx.mask().contains(10));
        ctx.end_delivery();
        assert!(!ctx.mask().contains(5));
        assert!(!ctx.mask().contains(10));
    }
}
