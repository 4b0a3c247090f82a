//! Configuration Service Boundary
//!
//! Holds the current cluster configuration and notifies subscribers when an
//! external author saves a new one. Durable persistence of the document
//! across restarts belongs to an external collaborator; the control service
//! only observes the configuration read-only through this seam.

use crate::model::Deployment;
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

type ChangeListener = Box<dyn Fn(Arc<Deployment>) + Send + Sync>;

/// In-memory holder of the authored cluster configuration.
#[derive(Default)]
pub struct ConfigurationService {
    current: RwLock<Arc<Deployment>>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl ConfigurationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current configuration document.
    pub fn get(&self) -> Arc<Deployment> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Replace the configuration and notify every subscriber.
    pub fn save(&self, deployment: Deployment) {
        let document = Arc::new(deployment);
        {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            *current = Arc::clone(&document);
        }
        debug!(nodes = document.nodes.len(), "configuration saved");
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener(Arc::clone(&document));
        }
    }

    /// Subscribe to configuration changes. The callback runs synchronously
    /// inside `save`; keep it cheap (the control service only schedules a
    /// broadcast).
    pub fn on_change(&self, listener: impl Fn(Arc<Deployment>) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(listener));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Node;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[test]
    fn save_replaces_and_notifies() {
        let service = ConfigurationService::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        service.on_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let deployment =
            Deployment::new([Node::new(Uuid::from_u128(1), "node1.example.com")]);
        service.save(deployment.clone());

        assert_eq!(*service.get(), deployment);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prior_document_remains_valid_after_save() {
        let service = ConfigurationService::new();
        let first = service.get();
        service.save(Deployment::new([Node::new(
            Uuid::from_u128(2),
            "node2.example.com",
        )]));
        assert!(first.nodes.is_empty());
    }
}
