//! Replicant directory interface and an in-process implementation.
//!
//! The directory is the cluster-wide membership collaborator: nodes publish
//! "I host a replicant of service S" and interested parties subscribe to
//! ordered view updates for S. Agreement on membership itself is the
//! directory's problem (e.g. backed by a group communication stack); this
//! module only pins down the contract consumed here plus a process-local
//! implementation used by tests and single-process clusters.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use tokio::sync::mpsc;

use crate::cluster::{Endpoint, ReplicantView, ServiceIdentity, ViewId};
use crate::utils::ReplicallError;

/// One membership snapshot delivered to a subscriber. Always a full
/// replacement view, never a delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewUpdate {
    /// Identity of the service whose membership changed.
    pub service: ServiceIdentity,

    /// Complete live endpoint list in join order.
    pub endpoints: Vec<Endpoint>,

    /// Version of this view.
    pub view_id: ViewId,
}

impl ViewUpdate {
    /// Converts this update into an owned view snapshot.
    pub fn into_view(self) -> ReplicantView {
        ReplicantView::new(self.service, self.endpoints, self.view_id)
    }
}

/// Replicant directory trait. Implementations must deliver updates for the
/// same service identity in non-decreasing `view_id` order to every
/// subscriber, at-least-once; subscribers absorb duplicates by applying a
/// view only when its `view_id` strictly increases.
#[async_trait]
pub trait ReplicantDirectory: Send + Sync {
    /// Joins given endpoint into the cluster-wide membership of the service.
    async fn publish(
        &self,
        service: &ServiceIdentity,
        endpoint: Endpoint,
    ) -> Result<(), ReplicallError>;

    /// Removes given endpoint from the cluster-wide membership of the
    /// service.
    async fn unpublish(
        &self,
        service: &ServiceIdentity,
        endpoint: &Endpoint,
    ) -> Result<(), ReplicallError>;

    /// Subscribes to membership changes of the service. The current view is
    /// delivered immediately through the returned channel (so there is no
    /// missed-initial-event race), followed by every accepted change.
    async fn subscribe(
        &self,
        service: &ServiceIdentity,
    ) -> Result<mpsc::UnboundedReceiver<ViewUpdate>, ReplicallError>;
}

/// Per-service membership record inside `LocalDirectory`.
#[derive(Default)]
struct DirectoryEntry {
    /// Live endpoints in join order.
    endpoints: Vec<Endpoint>,

    /// Current view version; bumped on every accepted membership change.
    view_id: ViewId,

    /// Sender sides of subscriber channels.
    subscribers: Vec<mpsc::UnboundedSender<ViewUpdate>>,
}

/// In-process replicant directory. All nodes of a single-process cluster
/// (and the tests) share one instance; membership changes take effect under
/// one mutex, which trivially satisfies the ordered-delivery contract.
#[derive(Default)]
pub struct LocalDirectory {
    /// Map from service identity -> membership record.
    services: Mutex<HashMap<ServiceIdentity, DirectoryEntry>>,
}

impl LocalDirectory {
    /// Creates a new empty in-process directory.
    pub fn new() -> Self {
        LocalDirectory {
            services: Mutex::new(HashMap::new()),
        }
    }

    /// Fans the entry's current view out to all live subscribers, pruning
    /// the ones that have gone away.
    fn fanout(service: &ServiceIdentity, entry: &mut DirectoryEntry) {
        let update = ViewUpdate {
            service: service.clone(),
            endpoints: entry.endpoints.clone(),
            view_id: entry.view_id,
        };
        entry
            .subscribers
            .retain(|tx| tx.send(update.clone()).is_ok());
    }

    /// Gets the current (endpoints, view_id) snapshot of a service, if any
    /// membership record exists for it.
    pub fn snapshot(
        &self,
        service: &ServiceIdentity,
    ) -> Option<(Vec<Endpoint>, ViewId)> {
        let services =
            self.services.lock().unwrap_or_else(|p| p.into_inner());
        services
            .get(service)
            .map(|entry| (entry.endpoints.clone(), entry.view_id))
    }
}

#[async_trait]
impl ReplicantDirectory for LocalDirectory {
    async fn publish(
        &self,
        service: &ServiceIdentity,
        endpoint: Endpoint,
    ) -> Result<(), ReplicallError> {
        let mut services =
            self.services.lock().unwrap_or_else(|p| p.into_inner());
        let entry = services.entry(service.clone()).or_default();
        if entry.endpoints.contains(&endpoint) {
            // duplicate publish; membership unchanged, no view bump
            pf_debug!(
                "endpoint {} already published for '{}'",
                endpoint,
                service
            );
            return Ok(());
        }

        entry.endpoints.push(endpoint);
        entry.view_id += 1;
        Self::fanout(service, entry);
        pf_info!(
            "published replicant for '{}', view {} has {} endpoint(s)",
            service,
            entry.view_id,
            entry.endpoints.len()
        );
        Ok(())
    }

    async fn unpublish(
        &self,
        service: &ServiceIdentity,
        endpoint: &Endpoint,
    ) -> Result<(), ReplicallError> {
        let mut services =
            self.services.lock().unwrap_or_else(|p| p.into_inner());
        let entry = match services.get_mut(service) {
            Some(entry) => entry,
            None => {
                pf_debug!("unpublish for unknown service '{}'", service);
                return Ok(());
            }
        };
        let pos = match entry.endpoints.iter().position(|ep| ep == endpoint) {
            Some(pos) => pos,
            None => {
                // endpoint already gone; nothing to change
                pf_debug!(
                    "endpoint {} not published for '{}'",
                    endpoint,
                    service
                );
                return Ok(());
            }
        };

        entry.endpoints.remove(pos);
        entry.view_id += 1;
        Self::fanout(service, entry);
        pf_info!(
            "unpublished replicant for '{}', view {} has {} endpoint(s)",
            service,
            entry.view_id,
            entry.endpoints.len()
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        service: &ServiceIdentity,
    ) -> Result<mpsc::UnboundedReceiver<ViewUpdate>, ReplicallError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut services =
            self.services.lock().unwrap_or_else(|p| p.into_inner());
        let entry = services.entry(service.clone()).or_default();

        // deliver the current view right away under the same lock, so no
        // concurrent publish can slip in between snapshot and registration
        tx.send(ViewUpdate {
            service: service.clone(),
            endpoints: entry.endpoints.clone(),
            view_id: entry.view_id,
        })?;
        entry.subscribers.push(tx);

        Ok(rx)
    }
}
