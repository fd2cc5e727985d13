use tracing::debug;

use crate::model::Value;
use crate::path::paths_overlap;

pub type SubscriptionId = u64;

/// Old and new state along an affected path, delivered after a successful
/// write.
#[derive(Debug, Clone)]
pub struct NodeChange {
    /// The highest subscribed path covering the written path.
    pub path: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

type Callback = Box<dyn Fn(&NodeChange) + Send>;

/// Path-keyed change subscriptions. The writer asks for the highest
/// subscribed ancestor before a write and emits one change per completed
/// update.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: Vec<(SubscriptionId, String, Callback)>,
    next_id: SubscriptionId,
}

impl SubscriptionRegistry {
    pub fn subscribe(&mut self, path: &str, callback: Callback) -> SubscriptionId {
        let id = self.next_id;
        self.next_id += 1;
        self.subscriptions.push((id, path.to_string(), callback));
        debug!(path, id, "subscription added");
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.subscriptions.retain(|(sub_id, _, _)| *sub_id != id);
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// The highest (closest to the root) subscribed path on the same
    /// root-to-leaf line as `path`; `None` when no subscription is affected
    /// by a write there.
    pub fn top_event_path(&self, path: &str) -> Option<String> {
        self.subscriptions
            .iter()
            .filter(|(_, sub_path, _)| paths_overlap(sub_path, path))
            .map(|(_, sub_path, _)| sub_path.clone())
            .min_by_key(|sub_path| sub_path.len())
    }

    /// Delivers the change to every subscription covering its path.
    pub fn notify(&self, change: &NodeChange) {
        for (_, sub_path, callback) in &self.subscriptions {
            if paths_overlap(sub_path, &change.path) {
                callback(change);
            }
        }
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("count", &self.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn top_event_path_picks_highest_overlap() {
        let mut registry = SubscriptionRegistry::default();
        registry.subscribe("game/config", Box::new(|_| {}));
        registry.subscribe("game", Box::new(|_| {}));
        registry.subscribe("users", Box::new(|_| {}));

        assert_eq!(
            registry.top_event_path("game/config/name").as_deref(),
            Some("game")
        );
        assert_eq!(registry.top_event_path("users/a").as_deref(), Some("users"));
        assert_eq!(registry.top_event_path("posts"), None);
        // A write above every subscription still reports the highest one.
        assert_eq!(registry.top_event_path("").as_deref(), Some("game"));
    }

    #[test]
    fn notify_reaches_overlapping_subscribers() {
        let mut registry = SubscriptionRegistry::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        registry.subscribe(
            "a/b",
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.notify(&NodeChange {
            path: "a".into(),
            old: None,
            new: None,
        });
        registry.notify(&NodeChange {
            path: "x".into(),
            old: None,
            new: None,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_callback() {
        let mut registry = SubscriptionRegistry::default();
        let id = registry.subscribe("a", Box::new(|_| {}));
        assert!(registry.top_event_path("a/b").is_some());
        registry.unsubscribe(id);
        assert!(registry.top_event_path("a/b").is_none());
        assert!(registry.is_empty());
    }
}
