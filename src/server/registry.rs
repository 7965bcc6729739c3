//! Target registry: per-node lookup table from service identity to its
//! clustered target.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::cluster::ServiceIdentity;
use crate::server::ClusteredTarget;
use crate::utils::ReplicallError;

/// Per-node table mapping service identity -> clustered target. Lookup sits
/// on the hot invocation path, so reads take only a short shared-lock
/// section; registration and unregistration are rare.
#[derive(Default)]
pub struct TargetRegistry {
    /// Map from service identity -> target handle.
    targets: RwLock<HashMap<ServiceIdentity, Arc<ClusteredTarget>>>,
}

impl TargetRegistry {
    /// Creates a new empty registry.
    pub fn new() -> Self {
        TargetRegistry {
            targets: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a target under its own service identity. Strict: if the
    /// identity is already present the call fails with
    /// `DuplicateRegistration` and the existing target stays in place.
    pub fn register(
        &self,
        target: Arc<ClusteredTarget>,
    ) -> Result<(), ReplicallError> {
        let mut targets =
            self.targets.write().unwrap_or_else(|p| p.into_inner());
        match targets.entry(target.service().clone()) {
            Entry::Occupied(entry) => {
                pf_error!(
                    "service '{}' already registered on this node",
                    entry.key()
                );
                Err(ReplicallError::DuplicateRegistration(
                    entry.key().to_string(),
                ))
            }
            Entry::Vacant(entry) => {
                pf_info!("service '{}' registered", entry.key());
                entry.insert(target);
                Ok(())
            }
        }
    }

    /// Looks up the target for given identity. A `NotRegistered` failure is
    /// expected and retryable: a momentarily stale client can address a node
    /// that has already undeployed the service while convergence is in
    /// progress.
    pub fn lookup(
        &self,
        service: &ServiceIdentity,
    ) -> Result<Arc<ClusteredTarget>, ReplicallError> {
        let targets =
            self.targets.read().unwrap_or_else(|p| p.into_inner());
        match targets.get(service) {
            Some(target) => Ok(target.clone()),
            None => {
                Err(ReplicallError::NotRegistered(service.to_string()))
            }
        }
    }

    /// Unregisters the identity, returning the removed target if it was
    /// present. Idempotent.
    pub fn unregister(
        &self,
        service: &ServiceIdentity,
    ) -> Option<Arc<ClusteredTarget>> {
        let mut targets =
            self.targets.write().unwrap_or_else(|p| p.into_inner());
        let removed = targets.remove(service);
        if removed.is_some() {
            pf_info!("service '{}' unregistered", service);
        }
        removed
    }

    /// Number of registered targets.
    pub fn len(&self) -> usize {
        let targets =
            self.targets.read().unwrap_or_else(|p| p.into_inner());
        targets.len()
    }

    /// Returns whether the registry holds no targets.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use std::thread;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::cluster::Endpoint;
    use crate::server::{
        AuthorizationState, InvocationContext, ServiceInvoker,
    };

    #[derive(Debug)]
    struct NullInvoker;

    #[async_trait]
    impl ServiceInvoker for NullInvoker {
        async fn invoke(
            &self,
            _ctx: &InvocationContext,
            _method: &str,
            args: Bytes,
        ) -> Result<Bytes, Bytes> {
            Ok(args)
        }
    }

    fn new_target(name: &str) -> Arc<ClusteredTarget> {
        Arc::new(ClusteredTarget::new(
            ServiceIdentity::new(name),
            Endpoint::new(([127, 0, 0, 1], 52700).into()),
            AuthorizationState::Waiting,
            Arc::new(NullInvoker),
        ))
    }

    #[test]
    fn register_lookup_unregister() -> Result<(), ReplicallError> {
        let registry = TargetRegistry::new();
        let service = ServiceIdentity::new("echo");

        assert!(matches!(
            registry.lookup(&service),
            Err(ReplicallError::NotRegistered(_))
        ));

        registry.register(new_target("echo"))?;
        assert_eq!(registry.lookup(&service)?.service(), &service);
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(&service).is_some());
        assert!(registry.unregister(&service).is_none());
        assert!(registry.is_empty());
        Ok(())
    }

    #[test]
    fn duplicate_registration_rejected() -> Result<(), ReplicallError> {
        let registry = TargetRegistry::new();
        registry.register(new_target("echo"))?;
        assert!(matches!(
            registry.register(new_target("echo")),
            Err(ReplicallError::DuplicateRegistration(_))
        ));
        // the original registration stays reachable
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn concurrent_registration_single_winner() {
        let registry = Arc::new(TargetRegistry::new());
        let mut handles = vec![];
        for _ in 0..2 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                registry.register(new_target("echo")).is_ok()
            }));
        }

        let outcomes: Vec<bool> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(outcomes.iter().filter(|&&ok| ok).count(), 1);
        assert_eq!(registry.len(), 1);
    }
}
