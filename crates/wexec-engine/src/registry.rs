//! Concurrent mapping from request uuid to [`Request`] (§3, §4.4).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::request::Request;

/// A request is present in the registry iff it is non-terminal from the
/// executor's point of view. Insertion, terminal-state removal, and
/// enumeration all take the same mutex; none of them perform I/O or invoke
/// user callbacks while holding it.
#[derive(Default)]
pub struct RequestRegistry {
    inner: Mutex<HashMap<Uuid, Arc<Request>>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, request: Arc<Request>) {
        self.inner.lock().unwrap().insert(request.uuid, request);
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Arc<Request>> {
        self.inner.lock().unwrap().get(uuid).cloned()
    }

    pub fn remove(&self, uuid: &Uuid) -> Option<Arc<Request>> {
        self.inner.lock().unwrap().remove(uuid)
    }

    /// Copy out the currently-registered uuids and release the lock; callers
    /// should re-fetch each one via [`RequestRegistry::get`] before acting on
    /// it, since it may have been removed concurrently.
    pub fn snapshot_uuids(&self) -> Vec<Uuid> {
        self.inner.lock().unwrap().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every registered request, for use at shutdown.
    pub fn drain(&self) -> Vec<Arc<Request>> {
        self.inner.lock().unwrap().drain().map(|(_, v)| v).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Action;
    use std::time::Duration;

    fn sample_request() -> Arc<Request> {
        let (request, _rx) = Request::new(
            Uuid::new_v4(),
            "add",
            Action::Execute,
            serde_json::json!({}),
            Duration::from_secs(60),
            None,
            None,
        );
        Arc::new(request)
    }

    #[test]
    fn insert_get_remove_round_trip() {
        let registry = RequestRegistry::new();
        let request = sample_request();
        let uuid = request.uuid;
        registry.insert(request);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&uuid).is_some());
        assert!(registry.remove(&uuid).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn snapshot_uuids_tolerates_concurrent_removal() {
        let registry = RequestRegistry::new();
        let request = sample_request();
        let uuid = request.uuid;
        registry.insert(request);
        let snapshot = registry.snapshot_uuids();
        registry.remove(&uuid);
        // The snapshot still names the uuid even though it is now gone;
        // callers must re-fetch and tolerate a miss.
        assert_eq!(snapshot, vec![uuid]);
        assert!(registry.get(&uuid).is_none());
    }
}
