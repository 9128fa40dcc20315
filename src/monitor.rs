use crate::instance::VmState;
use serde_json::Value;

/// Persistence and event sink for instance lifecycle changes.
///
/// `persist_state_for` is invoked under the instance's mutex at every
/// state transition, so implementations must never call back into the
/// instance. The monitor must outlive every instance it observes.
pub trait VmStatusMonitor: Send + Sync {
    /// Record a state transition.
    fn persist_state_for(&self, name: &str, state: VmState);

    /// Fetch the stored metadata for an instance; `{}` when none exists.
    fn retrieve_metadata_for(&self, name: &str) -> Value;

    /// Replace the stored metadata for an instance.
    fn update_metadata_for(&self, name: &str, metadata: Value);

    fn on_resume(&self);

    fn on_shutdown(&self);

    fn on_suspend(&self);
}
