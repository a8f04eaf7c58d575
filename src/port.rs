//! The architecture-port interface the core consumes.
//!
//! This crate never implements register-level context switching, stack
//! framing, or interrupt-priority programming — those live in a separate,
//! chip/architecture-specific crate that implements [`Port`] and drives
//! [`crate::scheduler::Kernel::tick`] from a periodic interrupt. This
//! mirrors `r3_kernel`'s `PortThreading`, with the const-generic trait
//! machinery collapsed away: the core only needs the four operations below.

/// Opaque interrupt-mask state returned by [`Port::enter_critical`] and
/// consumed by [`Port::leave_critical`]. Treated as a black box by the core;
/// a typical port stores the previous `PRIMASK`/`BASEPRI` value here.
pub trait CriticalCookie: Copy {}

impl CriticalCookie for u32 {}
impl CriticalCookie for () {}

/// The architecture/board collaborator the kernel core consumes.
///
/// # Safety
///
/// Implementors must ensure `enter_critical`/`leave_critical` really do mask
/// every interrupt that could call back into the kernel (the tick source and
/// any interrupt-context kernel callers) up to the configured threshold,
/// reentrantly, and that [`Port::request_context_switch`] causes the
/// lowest-priority architectural interrupt to become pending such that it
/// fires the instant the outermost critical section ends.
pub unsafe trait Port: 'static {
    /// The cookie produced by `enter_critical`.
    type Cookie: CriticalCookie;

    /// Raise the interrupt-priority mask to the kernel threshold. Reentrant:
    /// nested calls must be balanced by the same number of
    /// [`Port::leave_critical`] calls before interrupts are truly unmasked
    /// again.
    fn enter_critical() -> Self::Cookie;

    /// Restore the interrupt-priority mask to what it was before the
    /// matching [`Port::enter_critical`].
    ///
    /// # Safety
    ///
    /// `cookie` must be the value returned by the most recent unmatched
    /// `enter_critical` call on this core.
    unsafe fn leave_critical(cookie: Self::Cookie);

    /// Cause the lowest-priority architectural interrupt that performs the
    /// actual context save/restore to become pending.
    ///
    /// Must be callable both from task context and from interrupt context
    /// (the tick hook calls it directly). Must not itself block.
    fn request_context_switch();

    /// Prepare `stack` so that the first context switch into the thread
    /// enters `entry(arg)`, and so that returning from `entry` lands in
    /// `exit`.
    ///
    /// # Safety
    ///
    /// `stack` must be a region the caller owns exclusively for the
    /// lifetime of the thread, correctly aligned for the target's calling
    /// convention and large enough for a stack frame.
    unsafe fn initialize_stack(
        stack: &mut [u8],
        entry: unsafe extern "C" fn(usize),
        arg: usize,
        exit: unsafe extern "C" fn() -> !,
    ) -> *mut ();
}
