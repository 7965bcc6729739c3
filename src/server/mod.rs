//! Replicall's server-side functionality modules.

mod deploy;
mod dispatch;
mod external;
mod registry;
mod target;

pub use deploy::Deployment;
pub use dispatch::{
    CallFault, CallReply, CallRequest, InvocationContext,
    InvocationDispatcher, RequestId, ServiceInvoker,
};
pub use external::{ApiReply, ApiRequest, InvocationApi};
pub use registry::TargetRegistry;
pub use target::{AuthorizationState, ClusteredTarget, ViewListener};
