//! Manager trait and lifecycle
//!
//! A manager is a long-lived subsystem registered with the kernel. It
//! reacts to events on the kernel thread and must not block there: handlers
//! enqueue follow-up work or hand it to their own tasks.
//!
//! Lifecycle: stopped -> prepare_startup -> startup -> running ->
//! prepare_shutdown -> shutdown -> stopped. The kernel advances the whole
//! system only when every registered manager has signalled readiness for
//! the pending transition.

use crate::event::{Event, EventType};
use crate::kernel::KernelCore;
use std::sync::Arc;

pub trait Manager: Send {
    fn name(&self) -> &'static str;

    fn core(&self) -> &Arc<KernelCore>;

    /// Which public events this manager wants. Lifecycle events are always
    /// delivered through the dedicated hooks; private events reach only the
    /// manager that registered the id.
    fn wants(&self, etype: &EventType) -> bool;

    fn on_event(&mut self, event: &Event);

    /// Initialize and spawn tasks. The default signals readiness
    /// immediately; a manager with asynchronous setup signals later itself.
    fn on_prepare_startup(&mut self) {
        let core = self.core().clone();
        core.signal_ready_for_startup(self.name());
    }

    fn on_startup(&mut self) {}

    /// Stop tasks. The default signals readiness immediately; a manager
    /// waiting for workers to unwind signals later itself.
    fn on_prepare_shutdown(&mut self) {
        let core = self.core().clone();
        core.signal_ready_for_shutdown(self.name());
    }

    /// Final cleanup; the default unregisters from the kernel, which exits
    /// its loop once no manager remains.
    fn on_shutdown(&mut self) {
        let core = self.core().clone();
        core.unregister_manager(self.name());
    }
}
