//! Namespaced notification bus.
//!
//! # Design
//!
//! Each schema owns one bus keyed by its namespace. Startup is two-phase:
//! subscriptions are registered while the bus is open, then
//! `finish_registration` seals it. Publishing before the seal parks the
//! publisher until registration completes, so no event can race past a
//! subscriber that has not attached yet. Handlers run sequentially and a
//! failing handler never blocks the rest.

use crate::topic::{Topic, LIFECYCLE_MODES};
use armature_core::{ArmatureResult, NotifyError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::watch;

/// Payload delivered to every subscriber of a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyEvent {
    /// Full topic, `namespace:kind:mode`.
    pub id: String,
    /// Event body, usually the flattened node.
    pub data: Value,
    /// Correlation id, preserved across parent bubbling.
    pub trace_id: String,
    /// Logical origin of the event (operation or service name).
    pub notifier: String,
}

/// A registered event handler.
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Stable name used in failure logs.
    fn name(&self) -> &str;

    async fn handle(&self, event: &NotifyEvent) -> ArmatureResult<()>;
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn Subscriber>,
    /// Bridges re-publish into a child namespace. Bubbled deliveries skip
    /// them so bubbling stops after one level.
    bridge: bool,
}

/// Publish/subscribe bus for one namespace.
pub struct NotifyBus {
    namespace: String,
    sealed: AtomicBool,
    ready: watch::Sender<bool>,
    subscriptions: RwLock<HashMap<String, Vec<Registration>>>,
}

impl NotifyBus {
    pub fn new(namespace: &str) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            namespace: namespace.to_string(),
            sealed: AtomicBool::new(false),
            ready,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a bus that also receives the parent's `record:*` events,
    /// re-published under its own namespace. Bubbling is one level deep.
    pub fn with_parent(namespace: &str, parent: &NotifyBus) -> Result<Arc<Self>, NotifyError> {
        if parent.is_sealed() {
            return Err(NotifyError::Sealed {
                namespace: parent.namespace.clone(),
            });
        }
        let child = Arc::new(Self::new(namespace));
        let bridge: Arc<dyn Subscriber> = Arc::new(ParentBridge {
            child: Arc::downgrade(&child),
        });
        for mode in LIFECYCLE_MODES {
            parent.register(&format!("record:{mode}"), bridge.clone(), true);
        }
        Ok(child)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Attach a handler to a `kind:mode` suffix. `record:*` expands to the
    /// three lifecycle modes at subscribe time. Only valid before
    /// `finish_registration`.
    pub fn subscribe(
        &self,
        suffix: &str,
        handler: Arc<dyn Subscriber>,
    ) -> Result<(), NotifyError> {
        if self.is_sealed() {
            return Err(NotifyError::Sealed {
                namespace: self.namespace.clone(),
            });
        }
        let topic = Topic::parse(suffix)?;
        for concrete in topic.expand() {
            self.register(&concrete, handler.clone(), false);
        }
        Ok(())
    }

    fn register(&self, suffix: &str, handler: Arc<dyn Subscriber>, bridge: bool) {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        subscriptions
            .entry(suffix.to_string())
            .or_default()
            .push(Registration { handler, bridge });
    }

    /// Seal the bus and release any publishers parked in `notify`.
    pub fn finish_registration(&self) {
        self.sealed.store(true, Ordering::Release);
        self.ready.send_replace(true);
    }

    /// Publish to an exact `kind:mode` topic. Parks until the bus is
    /// sealed, then delivers to each subscriber in registration order.
    pub async fn notify(
        &self,
        suffix: &str,
        data: Value,
        notifier: &str,
    ) -> Result<NotifyEvent, NotifyError> {
        let topic = Topic::parse(suffix)?;
        if topic.is_wildcard() {
            return Err(NotifyError::BadTopic {
                topic: suffix.to_string(),
            });
        }

        let mut ready = self.ready.subscribe();
        // The sender lives in self, so waiting cannot fail while the bus
        // is alive.
        let _ = ready.wait_for(|sealed| *sealed).await;

        let event = NotifyEvent {
            id: topic.full(&self.namespace),
            data,
            trace_id: uuid::Uuid::new_v4().to_string(),
            notifier: notifier.to_string(),
        };
        self.dispatch(&topic.suffix(), &event, true).await;
        Ok(event)
    }

    /// Deliver a parent-originated event under this namespace, keeping the
    /// original trace id and notifier.
    async fn republish(&self, suffix: &str, origin: &NotifyEvent) {
        let event = NotifyEvent {
            id: format!("{}:{suffix}", self.namespace),
            data: origin.data.clone(),
            trace_id: origin.trace_id.clone(),
            notifier: origin.notifier.clone(),
        };
        self.dispatch(suffix, &event, false).await;
    }

    async fn dispatch(&self, suffix: &str, event: &NotifyEvent, include_bridges: bool) {
        let handlers: Vec<Registration> = {
            let subscriptions = self
                .subscriptions
                .read()
                .unwrap_or_else(|e| e.into_inner());
            subscriptions
                .get(suffix)
                .map(|regs| {
                    regs.iter()
                        .filter(|reg| include_bridges || !reg.bridge)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        for registration in handlers {
            if let Err(e) = registration.handler.handle(event).await {
                tracing::warn!(
                    error = %e,
                    topic = %event.id,
                    subscriber = registration.handler.name(),
                    "notify handler failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for NotifyBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifyBus")
            .field("namespace", &self.namespace)
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

/// Forwards a parent's record events into a child namespace.
struct ParentBridge {
    child: Weak<NotifyBus>,
}

#[async_trait]
impl Subscriber for ParentBridge {
    fn name(&self) -> &str {
        "parent-bridge"
    }

    async fn handle(&self, event: &NotifyEvent) -> ArmatureResult<()> {
        let Some(child) = self.child.upgrade() else {
            return Ok(());
        };
        // Strip the parent namespace, keep `kind:mode`.
        let mut segments = event.id.rsplitn(3, ':');
        let (Some(mode), Some(kind)) = (segments.next(), segments.next()) else {
            return Ok(());
        };
        child.republish(&format!("{kind}:{mode}"), event).await;
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
