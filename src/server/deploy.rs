//! Deployment lifecycle wiring for one locally hosted clustered service:
//! target creation, registration, directory publication, and the ordered
//! teardown that closes the dispatch-after-removal window.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::cluster::{Endpoint, ReplicantDirectory, ServiceIdentity};
use crate::server::{
    AuthorizationState, ClusteredTarget, ServiceInvoker, TargetRegistry,
};
use crate::utils::ReplicallError;

/// Handle to one locally deployed clustered service. Owns the update
/// forwarding task that feeds directory membership changes into the target.
pub struct Deployment {
    /// Identity of the deployed service.
    service: ServiceIdentity,

    /// This node's endpoint for the service.
    endpoint: Endpoint,

    /// The target created for this deployment.
    target: Arc<ClusteredTarget>,

    /// Registry the target is registered in.
    registry: Arc<TargetRegistry>,

    /// Directory the endpoint is published to.
    directory: Arc<dyn ReplicantDirectory>,

    /// Join handle of the view update forwarding task.
    forwarder_handle: Option<JoinHandle<()>>,

    /// Set once `about_to_stop()` has completed.
    stopped: bool,
}

impl Deployment {
    /// Deploys a clustered service on this node: creates its target in
    /// Waiting state, registers it for local dispatch, publishes the local
    /// endpoint for cluster-wide visibility, and starts forwarding directory
    /// view updates into the target.
    ///
    /// Fails with `DuplicateRegistration` if the identity is already
    /// deployed on this node.
    pub async fn deploy(
        registry: Arc<TargetRegistry>,
        directory: Arc<dyn ReplicantDirectory>,
        service: ServiceIdentity,
        endpoint: Endpoint,
        invoker: Arc<dyn ServiceInvoker>,
    ) -> Result<Self, ReplicallError> {
        let target = Arc::new(ClusteredTarget::new(
            service.clone(),
            endpoint.clone(),
            AuthorizationState::Waiting,
            invoker,
        ));
        registry.register(target.clone())?;

        if let Err(e) = directory.publish(&service, endpoint.clone()).await {
            // roll the local registration back so a later deploy can retry
            registry.unregister(&service);
            target.destroy();
            return Err(e);
        }

        // the subscription delivers the current view immediately, then every
        // later change in increasing view order; the target drops stale and
        // duplicate deliveries itself
        let mut rx_update = directory.subscribe(&service).await?;
        let fwd_target = target.clone();
        let forwarder_handle = tokio::spawn(async move {
            while let Some(update) = rx_update.recv().await {
                fwd_target
                    .apply_view_update(update.endpoints, update.view_id);
            }
        });

        pf_info!("service '{}' deployed at {}", service, endpoint);
        Ok(Deployment {
            service,
            endpoint,
            target,
            registry,
            directory,
            forwarder_handle: Some(forwarder_handle),
            stopped: false,
        })
    }

    /// Gets the identity of the deployed service.
    pub fn service(&self) -> &ServiceIdentity {
        &self.service
    }

    /// Gets the target created for this deployment.
    pub fn target(&self) -> &Arc<ClusteredTarget> {
        &self.target
    }

    /// Marks the service fully started: invocations are authorized from this
    /// point on.
    pub fn fully_started(&self) {
        self.target.set_authorization(AuthorizationState::Enabled);
        pf_info!("service '{}' fully started", self.service);
    }

    /// Begins teardown of the service. Authorization is dropped first so no
    /// new call can be dispatched while the target is being removed; only
    /// then is the target unregistered, the endpoint withdrawn from the
    /// directory, and the target destroyed. In-flight calls already past the
    /// authorization check complete undisturbed. Idempotent.
    pub async fn about_to_stop(&mut self) -> Result<(), ReplicallError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        self.target.set_authorization(AuthorizationState::Disabled);
        self.registry.unregister(&self.service);
        self.directory
            .unpublish(&self.service, &self.endpoint)
            .await?;

        if let Some(handle) = self.forwarder_handle.take() {
            handle.abort();
        }
        self.target.destroy();
        pf_info!("service '{}' undeployed", self.service);
        Ok(())
    }
}

impl Drop for Deployment {
    fn drop(&mut self) {
        // the forwarding task must not outlive the deployment handle
        if let Some(handle) = self.forwarder_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod deploy_tests {
    use super::*;

    use async_trait::async_trait;
    use bytes::Bytes;

    use tokio::time::{self, Duration};

    use crate::cluster::{LocalDirectory, ViewId};
    use crate::server::{
        CallFault, CallRequest, InvocationContext, InvocationDispatcher,
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

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new(([127, 0, 0, 1], port).into())
    }

    /// Polls until the target has caught up to at least given view version.
    async fn wait_for_view(
        target: &Arc<ClusteredTarget>,
        want: ViewId,
    ) -> bool {
        for _ in 0..100 {
            if target.view_id() >= want {
                return true;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_lifecycle() -> Result<(), ReplicallError> {
        let registry = Arc::new(TargetRegistry::new());
        let directory = Arc::new(LocalDirectory::new());
        let service = ServiceIdentity::new("echo");

        let mut deployment = Deployment::deploy(
            registry.clone(),
            directory.clone(),
            service.clone(),
            endpoint(52730),
            Arc::new(NullInvoker),
        )
        .await?;

        // deploying registered the target but kept it Waiting
        let target = registry.lookup(&service)?;
        assert!(!target.invocations_allowed());

        // the directory publication flows back in as view 1
        assert!(wait_for_view(deployment.target(), 1).await);

        deployment.fully_started();
        assert!(target.invocations_allowed());

        // a sibling replicant joins; the view catches up to 2
        directory.publish(&service, endpoint(52731)).await?;
        assert!(wait_for_view(deployment.target(), 2).await);
        assert_eq!(
            deployment.target().current_view().endpoints(),
            &[endpoint(52730), endpoint(52731)]
        );

        // teardown: disabled, unreachable, withdrawn from the directory
        deployment.about_to_stop().await?;
        assert!(!target.invocations_allowed());
        assert!(registry.lookup(&service).is_err());
        assert_eq!(
            directory.snapshot(&service),
            Some((vec![endpoint(52731)], 3))
        );

        // second stop is a no-op
        deployment.about_to_stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_deploy_rejected() -> Result<(), ReplicallError> {
        let registry = Arc::new(TargetRegistry::new());
        let directory = Arc::new(LocalDirectory::new());
        let service = ServiceIdentity::new("echo");

        let _first = Deployment::deploy(
            registry.clone(),
            directory.clone(),
            service.clone(),
            endpoint(52740),
            Arc::new(NullInvoker),
        )
        .await?;

        let second = Deployment::deploy(
            registry.clone(),
            directory.clone(),
            service.clone(),
            endpoint(52741),
            Arc::new(NullInvoker),
        )
        .await;
        assert!(matches!(
            second,
            Err(ReplicallError::DuplicateRegistration(_))
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn convergence_lag_routing() -> Result<(), ReplicallError> {
        let registry = Arc::new(TargetRegistry::new());
        let directory = Arc::new(LocalDirectory::new());
        let service = ServiceIdentity::new("echo");
        let dispatcher = InvocationDispatcher::new(registry.clone());

        let mut deployment = Deployment::deploy(
            registry.clone(),
            directory.clone(),
            service.clone(),
            endpoint(52750),
            Arc::new(NullInvoker),
        )
        .await?;
        deployment.fully_started();
        deployment.about_to_stop().await?;

        // a stale client addressing this node gets a retryable fault, not a
        // crash and not a silently wrong result
        let reply = dispatcher
            .dispatch(
                InvocationContext {
                    client: 1,
                    request: 0,
                },
                CallRequest {
                    service: service.clone(),
                    method: "echo".into(),
                    args: Bytes::from_static(b"late"),
                    client_view_id: 1,
                },
            )
            .await;
        assert!(matches!(
            reply.outcome,
            Err(CallFault::Routing { .. })
        ));
        Ok(())
    }
}
