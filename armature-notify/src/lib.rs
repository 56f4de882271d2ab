//! ARMATURE Notify - Namespaced Publish/Subscribe Bus
//!
//! Per-namespace event delivery for node lifecycle transitions and
//! application events: two-phase startup (subscribe, then seal),
//! subscribe-time wildcard expansion, sequential isolated handler
//! execution, and one-level parent-to-child bubbling.

pub mod bus;
pub mod topic;

pub use bus::{NotifyBus, NotifyEvent, Subscriber};
pub use topic::{Topic, TopicKind, LIFECYCLE_MODES};
