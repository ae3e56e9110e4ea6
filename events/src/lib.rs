//! In-process publish/subscribe bus
//!
//! Local subsystems are notified about cluster changes (snapshot updates, node
//! disconnects, head changes) through the [`EventManager`] without the
//! coordination core knowing who consumes them:
//! - Typed listener tables keyed by event type
//! - Channel scoping (`*` matches every channel)
//! - Six fixed invocation tiers, lower tiers run earlier
//! - Bulk removal by [`ModuleToken`] for hot-unloaded extensions

pub mod error;
pub mod manager;
pub mod module;

pub use error::{EventError, EventResult, ListenerFailure};
pub use manager::{
    EventListenerHandle, EventManager, EventPriority, ListenerOptions, ANY_CHANNEL,
};
pub use module::ModuleToken;
