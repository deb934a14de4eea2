//! Interrupt isolation for custom-action behaviors that may interrupt their
//! own worker (spec §4.3, §5, §9).
//!
//! Real OS/VM thread-interrupt semantics are platform-specific; the spec's
//! design notes (§9) say to model this as an abstract pre/post-critical-section
//! operation. [`InterruptModifier`] is that abstraction: the engine calls
//! `pre_critical_section` before every dependency call and custom-action
//! invocation made by an interrupt-capable node, and `post_critical_section`
//! after, so that whatever the modifier does (save-and-clear an interrupt
//! flag, mask a signal, etc.) never leaks into unrelated code. The default is
//! a no-op, matching nodes that don't opt out of interrupt delivery.
pub trait InterruptModifier: Send + Sync {
    fn pre_critical_section(&self) {}
    fn post_critical_section(&self) {}
}

/// The default modifier: does nothing. Used by every node unless it supplies
/// its own (e.g. to let a shutdown interrupt survive, per spec §4.3).
pub struct NoopInterruptModifier;

impl InterruptModifier for NoopInterruptModifier {}
