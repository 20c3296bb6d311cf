//! Lifecycle classifier
//!
//! Maps an entity's observed state to the action the reconciler owes it.
//! Pure and total over (lifecycle, provisioned?, dependencies-ready?), so
//! the whole decision table is testable without any I/O.

use crate::domain::tags::Life;

/// The action owed to one entity or attachment on this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Alive and unprovisioned with every dependency ready: create it.
    Provision,
    /// Departing with backend state behind it: destroy or detach it.
    Deprovision,
    /// Departing and nothing was ever created: remove the record directly.
    Remove,
    /// Work owed, but a dependency is missing. Stay pending without an
    /// error; a later wake re-offers the entity.
    Defer,
    /// Alive and already provisioned. Provisioning info is immutable, so
    /// there is nothing to converge.
    NoAction,
}

/// Classify one entity.
///
/// `has_info` is whether provisioning info has been published for it;
/// `dependencies_ready` covers whatever the entity's kind needs before
/// creation (for attachments: the storage entity provisioned and the
/// machine holding a backend instance). Dependencies only gate
/// provisioning; a departing entity's cleanup never waits for them.
pub fn classify(life: Life, has_info: bool, dependencies_ready: bool) -> Decision {
    if life.is_departing() {
        if has_info {
            Decision::Deprovision
        } else {
            Decision::Remove
        }
    } else if has_info {
        Decision::NoAction
    } else if dependencies_ready {
        Decision::Provision
    } else {
        Decision::Defer
    }
}
