//! Server-side invocation dispatcher and the call/reply envelope types
//! exchanged with client proxies.

use std::sync::Arc;

use async_trait::async_trait;

use bytes::Bytes;

use serde::{Deserialize, Serialize};

use crate::client::ClientId;
use crate::cluster::{Endpoint, ReplicantView, ServiceIdentity, ViewId};
use crate::server::{AuthorizationState, TargetRegistry};

/// Call request ID type, assigned by clients per attempt.
pub type RequestId = u64;

/// Invocation envelope sent from a client proxy to a server node.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    /// Identity of the logical service being called.
    pub service: ServiceIdentity,

    /// Method selector, interpreted by the application service only.
    pub method: String,

    /// Opaque call arguments.
    pub args: Bytes,

    /// Version of the replicant view the client selected its endpoint from.
    pub client_view_id: ViewId,
}

/// Fault side of a call outcome.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CallFault {
    /// Cluster routing fault: the call never reached application code and
    /// is safe to retry against another replicant. Expected while cluster
    /// membership convergence is in progress.
    Routing {
        /// Human-readable rejection reason.
        reason: String,
    },

    /// Application-level fault payload, passed through unmodified. Never
    /// retried by the invocation layer.
    Application(Bytes),
}

/// Reply envelope sent back to the client proxy.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct CallReply {
    /// Call result bytes, or the fault that ended the call.
    pub outcome: Result<Bytes, CallFault>,

    /// Version of the serving target's view at reply time. `None` only when
    /// no target was found for the identity.
    pub server_view_id: Option<ViewId>,

    /// Set iff the client's view version differs from the server's: the
    /// complete fresh endpoint list, letting the caller refresh its cached
    /// view without a directory round-trip.
    pub new_endpoints: Option<Vec<Endpoint>>,
}

/// Explicit per-call execution context handed to the application invoker.
/// Built fresh for every dispatch and dropped when the call ends, so there
/// is no ambient per-thread state to save and restore around calls.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct InvocationContext {
    /// ID of the calling client.
    pub client: ClientId,

    /// Client-assigned ID of this call.
    pub request: RequestId,
}

/// Application service trait: the node-local object a clustered service's
/// calls are executed against.
#[async_trait]
pub trait ServiceInvoker: Send + Sync {
    /// Executes one application call. The `Err` side carries an opaque
    /// application fault payload that travels back to the caller unmodified.
    async fn invoke(
        &self,
        ctx: &InvocationContext,
        method: &str,
        args: Bytes,
    ) -> Result<Bytes, Bytes>;
}

/// Server-side invocation entry point, executed once per inbound call.
pub struct InvocationDispatcher {
    /// This node's target registry.
    registry: Arc<TargetRegistry>,
}

impl InvocationDispatcher {
    /// Creates a new dispatcher over given registry.
    pub fn new(registry: Arc<TargetRegistry>) -> Self {
        InvocationDispatcher { registry }
    }

    /// Gets a handle to the underlying registry.
    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// Computes the piggybacked endpoint list for a reply: attached iff the
    /// client's view version differs from the server's.
    fn piggyback(
        client_view_id: ViewId,
        view: &ReplicantView,
    ) -> Option<Vec<Endpoint>> {
        if client_view_id != view.view_id() {
            Some(view.endpoints().to_vec())
        } else {
            None
        }
    }

    /// Dispatches one inbound call: resolves the target, gates on its
    /// authorization state, executes the application call, and builds the
    /// reply envelope. Dispatch itself mutates no cluster state, and no
    /// cluster-state lock is held while the application call runs.
    pub async fn dispatch(
        &self,
        ctx: InvocationContext,
        req: CallRequest,
    ) -> CallReply {
        let CallRequest {
            service,
            method,
            args,
            client_view_id,
        } = req;

        // resolve the target; a miss is expected during convergence lag
        let target = match self.registry.lookup(&service) {
            Ok(target) => target,
            Err(e) => {
                pf_debug!(
                    "routing fault for client {} req {}: {}",
                    ctx.client,
                    ctx.request,
                    e
                );
                return CallReply {
                    outcome: Err(CallFault::Routing {
                        reason: format!(
                            "target '{}' not registered on this node",
                            service
                        ),
                    }),
                    server_view_id: None,
                    new_endpoints: None,
                };
            }
        };

        // authorization and view are read under one guard
        let (auth, view) = target.auth_and_view();
        if auth != AuthorizationState::Enabled {
            pf_debug!(
                "call to '{}' rejected in state {:?}",
                service,
                auth
            );
            return CallReply {
                outcome: Err(CallFault::Routing {
                    reason: format!(
                        "invocations not currently allowed ({:?})",
                        auth
                    ),
                }),
                server_view_id: Some(view.view_id()),
                new_endpoints: Self::piggyback(client_view_id, &view),
            };
        }

        // the application call may block arbitrarily long; view swaps and
        // authorization changes proceed concurrently
        let outcome = match target
            .invoker()
            .invoke(&ctx, &method, args)
            .await
        {
            Ok(result) => Ok(result),
            Err(fault) => Err(CallFault::Application(fault)),
        };

        // the view may have moved while the call executed; piggyback the
        // freshest one
        let view = target.current_view();
        CallReply {
            outcome,
            server_view_id: Some(view.view_id()),
            new_endpoints: Self::piggyback(client_view_id, &view),
        }
    }
}
