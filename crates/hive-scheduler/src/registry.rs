//! Task state store with per-name change notification.

use dashmap::DashMap;
use tokio::sync::watch;

use crate::task::ScheduleTask;

/// Mapping from task name to [`ScheduleTask`], with one watch channel per
/// name. `set` publishes the new value to whoever is subscribed; a channel is
/// created lazily on first `set` or `watch` and stays open until `delete`.
#[derive(Default)]
pub struct TaskRegistry {
    state: DashMap<String, ScheduleTask>,
    channels: DashMap<String, watch::Sender<Option<ScheduleTask>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a task and notify subscribers of that name.
    pub fn set(&self, name: &str, task: ScheduleTask) {
        self.state.insert(name.to_string(), task.clone());

        let sender = self
            .channels
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(None).0);
        let _ = sender.send_replace(Some(task));
    }

    pub fn get(&self, name: &str) -> Option<ScheduleTask> {
        self.state.get(name).map(|entry| entry.value().clone())
    }

    /// Remove the task and close its notification channel. Absent names are
    /// not an error.
    pub fn delete(&self, name: &str) {
        self.state.remove(name);
        self.channels.remove(name);
    }

    pub fn exist(&self, name: &str) -> bool {
        self.state.contains_key(name)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn values(&self) -> Vec<ScheduleTask> {
        self.state.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn size(&self) -> usize {
        self.state.len()
    }

    /// Subscribe to changes of one task name. The receiver is seeded with
    /// the current value (`None` when the task is absent) and sees every
    /// subsequent `set` in call order.
    pub fn watch(&self, name: &str) -> watch::Receiver<Option<ScheduleTask>> {
        let sender = self
            .channels
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(self.get(name)).0);
        sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    fn task(name: &str) -> ScheduleTask {
        ScheduleTask::new(name, TaskKind::Interval { ms: 1000 })
    }

    #[test]
    fn set_get_delete() {
        let registry = TaskRegistry::new();
        assert!(!registry.exist("a"));
        assert!(registry.get("a").is_none());

        registry.set("a", task("a"));
        assert!(registry.exist("a"));
        assert_eq!(registry.size(), 1);
        assert_eq!(registry.keys(), vec!["a".to_string()]);

        registry.delete("a");
        assert!(!registry.exist("a"));
        assert_eq!(registry.size(), 0);
        // deleting a missing name is a no-op
        registry.delete("a");
    }

    #[tokio::test]
    async fn watch_is_seeded_and_notified_in_order() {
        let registry = TaskRegistry::new();
        let mut rx = registry.watch("t");
        assert!(rx.borrow().is_none());

        registry.set("t", task("t"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().name, "t");

        let mut updated = task("t");
        updated.response = Some(serde_json::json!("second"));
        registry.set("t", updated);
        rx.changed().await.unwrap();
        assert_eq!(
            rx.borrow().as_ref().unwrap().response,
            Some(serde_json::json!("second"))
        );
    }

    #[tokio::test]
    async fn watch_after_set_sees_current_value() {
        let registry = TaskRegistry::new();
        registry.set("t", task("t"));

        let rx = registry.watch("t");
        assert_eq!(rx.borrow().as_ref().unwrap().name, "t");
    }
}
