//! Load balance policies for picking one replicant endpoint per call.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cluster::{Endpoint, ReplicantView};
use crate::utils::ReplicallError;

/// Load balance policy trait: picks one endpoint out of a replicant view for
/// the next call. Implementations must be safe under concurrent calls from
/// multiple threads sharing one client proxy, so any internal cursor or seed
/// state is kept behind atomics or a mutex.
pub trait LoadBalancePolicy: fmt::Debug + Send + Sync {
    /// Selects an endpoint from given view, optionally guided by a per-call
    /// affinity key. Fails with `NoEndpointAvailable` if the view is empty.
    fn select(
        &self,
        view: &ReplicantView,
        affinity: Option<&str>,
    ) -> Result<Endpoint, ReplicallError>;
}

/// Rotates through the view's endpoints in join order. The cursor keeps
/// counting across view replacements and wraps by modulo, so distribution
/// stays approximately uniform even when the endpoint count changes.
#[derive(Debug, Default)]
pub struct RoundRobin {
    /// Monotonic selection counter.
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancePolicy for RoundRobin {
    fn select(
        &self,
        view: &ReplicantView,
        _affinity: Option<&str>,
    ) -> Result<Endpoint, ReplicallError> {
        if view.is_empty() {
            return Err(ReplicallError::NoEndpointAvailable(
                view.service().to_string(),
            ));
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % view.len();
        Ok(view.endpoints()[idx].clone())
    }
}

/// Always picks the first endpoint of the view. Useful for primary/backup
/// topologies where the join order encodes preference.
#[derive(Debug, Default)]
pub struct FirstAvailable;

impl FirstAvailable {
    pub fn new() -> Self {
        FirstAvailable
    }
}

impl LoadBalancePolicy for FirstAvailable {
    fn select(
        &self,
        view: &ReplicantView,
        _affinity: Option<&str>,
    ) -> Result<Endpoint, ReplicallError> {
        match view.endpoints().first() {
            Some(endpoint) => Ok(endpoint.clone()),
            None => Err(ReplicallError::NoEndpointAvailable(
                view.service().to_string(),
            )),
        }
    }
}

/// Uniform random pick. The generator is seeded once at policy creation,
/// not per call.
#[derive(Debug)]
pub struct Random {
    /// Per-policy random number generator state.
    rng: Mutex<StdRng>,
}

impl Random {
    pub fn new() -> Self {
        Random {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancePolicy for Random {
    fn select(
        &self,
        view: &ReplicantView,
        _affinity: Option<&str>,
    ) -> Result<Endpoint, ReplicallError> {
        if view.is_empty() {
            return Err(ReplicallError::NoEndpointAvailable(
                view.service().to_string(),
            ));
        }
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        let idx = rng.gen_range(0..view.len());
        Ok(view.endpoints()[idx].clone())
    }
}

/// Sticky-session selection: a given affinity key keeps routing to the same
/// endpoint for as long as that endpoint stays in the view. First sight of a
/// key hashes it into an endpoint index deterministically; if the remembered
/// endpoint has left the view, one round-robin pick reassigns the key.
#[derive(Debug, Default)]
pub struct StickyByKey {
    /// Remembered key -> endpoint assignments.
    assigned: Mutex<HashMap<String, Endpoint>>,

    /// Rotation used for keyless calls and for reassignment after an
    /// endpoint departs.
    fallback: RoundRobin,
}

impl StickyByKey {
    pub fn new() -> Self {
        StickyByKey {
            assigned: Mutex::new(HashMap::new()),
            fallback: RoundRobin::new(),
        }
    }
}

impl LoadBalancePolicy for StickyByKey {
    fn select(
        &self,
        view: &ReplicantView,
        affinity: Option<&str>,
    ) -> Result<Endpoint, ReplicallError> {
        if view.is_empty() {
            return Err(ReplicallError::NoEndpointAvailable(
                view.service().to_string(),
            ));
        }
        let key = match affinity {
            Some(key) => key,
            None => return self.fallback.select(view, None),
        };

        let mut assigned =
            self.assigned.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(endpoint) = assigned.get(key) {
            if view.contains(endpoint) {
                return Ok(endpoint.clone());
            }
            // remembered endpoint left the view; reassign via round-robin
            let endpoint = self.fallback.select(view, None)?;
            pf_debug!(
                "sticky key '{}' reassigned to endpoint {}",
                key,
                endpoint
            );
            assigned.insert(key.into(), endpoint.clone());
            return Ok(endpoint);
        }

        // first sight of this key: deterministic hash into endpoint index
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % view.len();
        let endpoint = view.endpoints()[idx].clone();
        assigned.insert(key.into(), endpoint.clone());
        Ok(endpoint)
    }
}

/// Enum of supported load balance policy kinds.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum BalancePolicyKind {
    RoundRobin,
    FirstAvailable,
    Random,
    StickyByKey,
}

impl BalancePolicyKind {
    /// Parses a command line string into a `BalancePolicyKind`.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name {
            "RoundRobin" => Some(Self::RoundRobin),
            "FirstAvailable" => Some(Self::FirstAvailable),
            "Random" => Some(Self::Random),
            "StickyByKey" => Some(Self::StickyByKey),
            _ => None,
        }
    }

    /// Creates a fresh policy instance of this kind on heap.
    pub fn new_policy(&self) -> Box<dyn LoadBalancePolicy> {
        match self {
            Self::RoundRobin => Box::new(RoundRobin::new()),
            Self::FirstAvailable => Box::new(FirstAvailable::new()),
            Self::Random => Box::new(Random::new()),
            Self::StickyByKey => Box::new(StickyByKey::new()),
        }
    }
}
