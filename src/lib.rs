//! Replicall core library: clustered remote invocation with replicant
//! failover.
//!
//! A logical service is replicated across multiple cluster nodes
//! ("replicants"). Clients call through a proxy that load-balances across the
//! replicants it knows about and fails over when one becomes unreachable.
//! Servers dispatch inbound calls through a per-node target registry, gate
//! them on the target's lifecycle state, and piggyback fresh membership views
//! on replies so that stale clients refresh lazily without a directory
//! round-trip per call.

#[macro_use]
pub mod utils;

pub mod cluster;

pub mod server;

pub mod client;

pub use crate::utils::{logger_init, ReplicallError, ME};

pub use crate::cluster::{
    BalancePolicyKind, Endpoint, FirstAvailable, LoadBalancePolicy,
    LocalDirectory, Random, ReplicantDirectory, ReplicantView, RoundRobin,
    ServiceIdentity, StickyByKey, ViewId, ViewUpdate,
};

pub use crate::server::{
    ApiReply, ApiRequest, AuthorizationState, CallFault, CallReply,
    CallRequest, ClusteredTarget, Deployment, InvocationApi,
    InvocationContext, InvocationDispatcher, RequestId, ServiceInvoker,
    TargetRegistry, ViewListener,
};

pub use crate::client::{
    CallTransport, ClientApiStub, ClientConfigProxy, ClientId, ClientProxy,
    TcpCallTransport,
};
