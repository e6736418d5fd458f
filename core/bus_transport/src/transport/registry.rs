//! Registry of live endpoints
//!
//! Shared between the listen loop (insert on accept, remove on a failed
//! handoff) and whoever owns shutdown. Every operation takes the one lock
//! internally; no caller ever holds it across a blocking call.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::endpoint::{Endpoint, EndpointId};

/// Ordered collection of registered endpoints
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: Mutex<Vec<Arc<Endpoint>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<Endpoint>>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an endpoint
    pub fn insert(&self, endpoint: Arc<Endpoint>) {
        let id = endpoint.id();
        let mut endpoints = self.lock();
        endpoints.push(endpoint);
        log::debug!("Registered {} ({} live)", id, endpoints.len());
    }

    /// Unregister an endpoint, handing back the registry's reference.
    ///
    /// The caller drops it outside the lock; destruction may block on the
    /// endpoint's push barrier.
    pub fn remove(&self, id: EndpointId) -> Option<Arc<Endpoint>> {
        let mut endpoints = self.lock();
        let index = endpoints.iter().position(|ep| ep.id() == id)?;
        let endpoint = endpoints.remove(index);
        log::debug!("Unregistered {} ({} live)", id, endpoints.len());
        Some(endpoint)
    }

    pub fn get(&self, id: EndpointId) -> Option<Arc<Endpoint>> {
        self.lock().iter().find(|ep| ep.id() == id).cloned()
    }

    pub fn contains(&self, id: EndpointId) -> bool {
        self.lock().iter().any(|ep| ep.id() == id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Ids in registration order
    pub fn ids(&self) -> Vec<EndpointId> {
        self.lock().iter().map(|ep| ep.id()).collect()
    }

    /// Visit every endpoint with the lock held.
    ///
    /// `f` must not call back into the registry.
    pub fn for_each(&self, mut f: impl FnMut(&Endpoint)) {
        for endpoint in self.lock().iter() {
            f(endpoint);
        }
    }

    /// Take every endpoint out of the registry.
    pub fn drain(&self) -> Vec<Arc<Endpoint>> {
        std::mem::take(&mut *self.lock())
    }

    /// Drain the registry, shut every stream down, and release the
    /// registry's references. Returns how many endpoints were stopped.
    pub fn shutdown_all(&self) -> usize {
        let endpoints = self.drain();
        let count = endpoints.len();
        for endpoint in endpoints {
            if let Err(e) = endpoint.shutdown() {
                log::debug!("{}: shutdown failed: {}", endpoint.id(), e);
            }
        }
        if count > 0 {
            log::info!("Stopped {} endpoints", count);
        }
        count
    }
}
