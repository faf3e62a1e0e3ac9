//! Matches deliveries to subscribers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::{ConsumerExecutorDescriptor, ConsumerRegistry};

/// Exact-name selector with a per-`(group, topic)` cache.
pub struct ConsumerSelector {
    registry: Arc<ConsumerRegistry>,
    cache: RwLock<HashMap<(String, String), Option<ConsumerExecutorDescriptor>>>,
}

impl ConsumerSelector {
    pub fn new(registry: Arc<ConsumerRegistry>) -> Self {
        Self {
            registry,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Every registered subscriber.
    pub fn select_candidates(&self) -> &[ConsumerExecutorDescriptor] {
        self.registry.descriptors()
    }

    /// First candidate whose topic equals `name`.
    pub fn select_best_candidate<'a>(
        name: &str,
        candidates: &'a [ConsumerExecutorDescriptor],
    ) -> Option<&'a ConsumerExecutorDescriptor> {
        candidates.iter().find(|d| d.topic == name)
    }

    /// Subscriber for `name` within `group`, if any. Misses are cached too.
    pub async fn select_by_group(
        &self,
        group: &str,
        name: &str,
    ) -> Option<ConsumerExecutorDescriptor> {
        let key = (group.to_string(), name.to_string());
        if let Some(hit) = self.cache.read().await.get(&key) {
            return hit.clone();
        }

        let in_group: Vec<ConsumerExecutorDescriptor> = self
            .select_candidates()
            .iter()
            .filter(|d| d.group == group)
            .cloned()
            .collect();
        let selected = Self::select_best_candidate(name, &in_group).cloned();

        self.cache
            .write()
            .await
            .entry(key)
            .or_insert(selected)
            .clone()
    }
}
