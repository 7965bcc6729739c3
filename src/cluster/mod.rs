//! Replicall's cluster-level data types, policies, and directory interface.

mod balance;
mod directory;
mod view;

pub use balance::{
    BalancePolicyKind, FirstAvailable, LoadBalancePolicy, Random, RoundRobin,
    StickyByKey,
};
pub use directory::{LocalDirectory, ReplicantDirectory, ViewUpdate};
pub use view::{Endpoint, ReplicantView, ServiceIdentity, ViewId};
