//! Core cluster data types: service identities, endpoints, replicant views.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Replicant view version number type. Monotonically increasing, scoped per
/// service identity.
pub type ViewId = u64;

/// Opaque, globally unique key identifying one logical clustered service.
///
/// Plays the role the original management-bean name played, but as a proper
/// immutable value type with structural equality, so lookups keyed by it
/// cannot suffer hash-code collisions between distinct names.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct ServiceIdentity(String);

impl ServiceIdentity {
    /// Creates a new service identity from its canonical name.
    pub fn new(name: impl ToString) -> Self {
        ServiceIdentity(name.to_string())
    }

    /// Gets the canonical name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serializable handle to one physical replicant of a clustered service.
/// Immutable value type; equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Socket address the replicant accepts invocations on.
    addr: SocketAddr,
}

impl Endpoint {
    /// Creates a new endpoint handle.
    pub fn new(addr: SocketAddr) -> Self {
        Endpoint { addr }
    }

    /// Gets the invocation socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

/// Immutable snapshot of a service's live endpoint list plus its version
/// number. Never mutated in place; a new instance replaces the old one
/// wholesale so that concurrent readers can share it freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicantView {
    /// Identity of the service this view belongs to.
    service: ServiceIdentity,

    /// Live endpoints in join order. The order carries no correctness
    /// meaning but keeps round-robin rotation deterministic.
    endpoints: Vec<Endpoint>,

    /// Version of this view.
    view_id: ViewId,
}

impl ReplicantView {
    /// Creates a new view snapshot.
    pub fn new(
        service: ServiceIdentity,
        endpoints: Vec<Endpoint>,
        view_id: ViewId,
    ) -> Self {
        ReplicantView {
            service,
            endpoints,
            view_id,
        }
    }

    /// Creates the initial single-endpoint view at version 0.
    pub fn singleton(service: ServiceIdentity, endpoint: Endpoint) -> Self {
        Self::new(service, vec![endpoint], 0)
    }

    /// Gets the identity of the service this view belongs to.
    pub fn service(&self) -> &ServiceIdentity {
        &self.service
    }

    /// Gets the live endpoints in join order.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Gets the version of this view.
    pub fn view_id(&self) -> ViewId {
        self.view_id
    }

    /// Number of live endpoints in this view.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Returns whether this view contains no endpoints.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Returns whether given endpoint is a member of this view.
    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.endpoints.contains(endpoint)
    }

    /// Derives a reduced view with given endpoints filtered out, preserving
    /// join order and version. Used by the client proxy to re-select over
    /// the remaining endpoints after marking some as suspect.
    pub fn without(&self, excluded: &HashSet<Endpoint>) -> ReplicantView {
        ReplicantView {
            service: self.service.clone(),
            endpoints: self
                .endpoints
                .iter()
                .filter(|ep| !excluded.contains(ep))
                .cloned()
                .collect(),
            view_id: self.view_id,
        }
    }
}
