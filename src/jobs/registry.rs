use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Cancellation side handed to the task that owns the running work.
#[derive(Clone)]
pub struct CancellationHandle {
    notify: Arc<Notify>,
}

impl CancellationHandle {
    fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
        }
    }

    /// Resolves once cancellation was requested. A request made before the
    /// first await is not lost.
    pub async fn cancelled(&self) {
        self.notify.notified().await;
    }

    fn cancel(&self) {
        self.notify.notify_one();
    }
}

/// Process-local map of job id to the handle of its live work.
///
/// Entries exist only while this process runs the job. After a restart, or
/// for work delegated to another service, there is no entry and
/// [`JobRegistry::cancel`] is a no-op returning `false`.
#[derive(Default)]
pub struct JobRegistry {
    handles: Mutex<HashMap<String, CancellationHandle>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: &str) -> CancellationHandle {
        let handle = CancellationHandle::new();
        self.handles
            .lock()
            .unwrap()
            .insert(job_id.to_string(), handle.clone());
        handle
    }

    /// Signal the job's owner. Returns whether a live handle existed.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.handles.lock().unwrap().remove(job_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, job_id: &str) {
        self.handles.lock().unwrap().remove(job_id);
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.handles.lock().unwrap().contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_before_wait_is_remembered() {
        let registry = JobRegistry::new();
        let handle = registry.register("job");
        assert!(registry.cancel("job"));
        tokio::time::timeout(Duration::from_secs(1), handle.cancelled())
            .await
            .expect("cancellation should already be signalled");
        assert!(!registry.contains("job"));
    }

    #[test]
    fn cancel_without_entry_is_a_noop() {
        let registry = JobRegistry::new();
        assert!(!registry.cancel("missing"));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn removed_handle_never_fires() {
        let registry = JobRegistry::new();
        let handle = registry.register("job");
        registry.remove("job");
        let fired = tokio::time::timeout(Duration::from_millis(50), handle.cancelled()).await;
        assert!(fired.is_err());
    }
}
