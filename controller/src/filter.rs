//! Turns the DaemonSet watch into reconcile requests.
//!
//! kube's watcher reports the latest state of each object; it does not pair updates with the previous state.
//! `EventTranslator` remembers the last observed object per key so that watch events can be classified as
//! create, update (with the old and new objects) or delete, and `passes` decides which of them are worth a
//! reconcile pass.
use crate::reconciler::RolloutTarget;
use models::daemonset;
use models::key::ObjectKey;

use k8s_openapi::api::apps::v1::DaemonSet;
use kube::runtime::watcher;
use std::collections::HashMap;
use tracing::{event, Level};

/// A classified change to a watched DaemonSet.
#[derive(Clone, Debug)]
pub enum FilterEvent {
    Create(DaemonSet),
    Update { old: DaemonSet, new: DaemonSet },
    Delete(DaemonSet),
    /// An event not caused by a change to the object itself.
    Generic(DaemonSet),
}

impl FilterEvent {
    /// The object the event refers to, in its latest known state.
    pub fn object(&self) -> &DaemonSet {
        match self {
            FilterEvent::Create(ds) | FilterEvent::Delete(ds) | FilterEvent::Generic(ds) => ds,
            FilterEvent::Update { new, .. } => new,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_resource(self.object())
    }
}

/// Returns true if the event should cause a reconcile pass.
///
/// Creations always pass so that a freshly installed target is reconciled. Updates pass only for the target,
/// and only when `status.updatedNumberScheduled` changed, which is the one status field that moves exactly
/// once per rollout step. Deletions and generic events never pass.
pub fn passes(target: &RolloutTarget, filter_event: &FilterEvent) -> bool {
    match filter_event {
        FilterEvent::Create(_) => true,
        FilterEvent::Update { old, new } => {
            let is_target = new.metadata.name.as_deref() == Some(target.name)
                && new.metadata.namespace.as_deref() == Some(target.namespace);

            is_target
                && daemonset::updated_number_scheduled(old)
                    != daemonset::updated_number_scheduled(new)
        }
        FilterEvent::Delete(_) | FilterEvent::Generic(_) => false,
    }
}

/// Classifies watcher events by comparing them against the last state seen for each object.
#[derive(Debug, Default)]
pub struct EventTranslator {
    last_seen: HashMap<ObjectKey, DaemonSet>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies one watcher event. A `Restarted` listing may yield several events.
    pub fn translate(&mut self, watch_event: watcher::Event<DaemonSet>) -> Vec<FilterEvent> {
        match watch_event {
            watcher::Event::Applied(ds) => vec![self.applied(ds)],
            watcher::Event::Deleted(ds) => {
                self.last_seen.remove(&ObjectKey::from_resource(&ds));
                vec![FilterEvent::Delete(ds)]
            }
            watcher::Event::Restarted(objects) => {
                let mut current: HashMap<ObjectKey, DaemonSet> = HashMap::new();
                let mut events = Vec::with_capacity(objects.len());
                for ds in objects {
                    current.insert(ObjectKey::from_resource(&ds), ds.clone());
                    events.push(self.applied(ds));
                }

                // Anything which disappeared while the watch was being re-established was deleted.
                for (key, ds) in self.last_seen.drain() {
                    if !current.contains_key(&key) {
                        event!(Level::DEBUG, object = %key, "Object vanished across a watch restart.");
                        events.push(FilterEvent::Delete(ds));
                    }
                }
                self.last_seen = current;
                events
            }
        }
    }

    fn applied(&mut self, ds: DaemonSet) -> FilterEvent {
        let key = ObjectKey::from_resource(&ds);
        match self.last_seen.insert(key, ds.clone()) {
            Some(old) => FilterEvent::Update { old, new: ds },
            None => FilterEvent::Create(ds),
        }
    }
}
