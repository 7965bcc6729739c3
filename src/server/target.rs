//! Clustered target: the authoritative per-node record of one service's
//! current membership view and call-eligibility state.

use std::sync::{Arc, RwLock};

use crate::cluster::{Endpoint, ReplicantView, ServiceIdentity, ViewId};
use crate::server::ServiceInvoker;
use crate::utils::ReplicallError;

/// Invocation authorization state of a clustered target.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum AuthorizationState {
    /// Target exists but is not yet safe to invoke (e.g. still deploying).
    Waiting,

    /// Calls proceed normally.
    Enabled,

    /// New calls are rejected with a retryable routing fault (e.g. during
    /// undeploy). In-flight calls already past the state check complete.
    Disabled,
}

/// Listener invoked synchronously on every accepted view replacement.
/// Typically regenerates and republishes client-visible handles.
pub type ViewListener = Arc<
    dyn Fn(&ServiceIdentity, &ReplicantView) -> Result<(), ReplicallError>
        + Send
        + Sync,
>;

/// Mutable state of a target, kept behind one lock so that readers always
/// observe a consistent (view, authorization) pair.
struct TargetInner {
    /// Current membership view, replaced wholesale on every accepted update.
    view: Arc<ReplicantView>,

    /// Current authorization state.
    auth: AuthorizationState,

    /// Set once `destroy()` has run; the target can never be re-enabled.
    destroyed: bool,

    /// Registered view replacement listeners.
    listeners: Vec<ViewListener>,
}

/// Per-node record of one logical clustered service: owns the current
/// replicant view, the invocation authorization state, and the local
/// application object calls are executed against.
pub struct ClusteredTarget {
    /// Identity of the service this target represents.
    service: ServiceIdentity,

    /// Local application object resolved for this service.
    invoker: Arc<dyn ServiceInvoker>,

    /// Lock-guarded mutable state.
    inner: RwLock<TargetInner>,
}

impl ClusteredTarget {
    /// Creates a new target whose view contains only the local endpoint at
    /// version 0.
    pub fn new(
        service: ServiceIdentity,
        initial_endpoint: Endpoint,
        initial_auth: AuthorizationState,
        invoker: Arc<dyn ServiceInvoker>,
    ) -> Self {
        let view = Arc::new(ReplicantView::singleton(
            service.clone(),
            initial_endpoint,
        ));
        ClusteredTarget {
            service,
            invoker,
            inner: RwLock::new(TargetInner {
                view,
                auth: initial_auth,
                destroyed: false,
                listeners: vec![],
            }),
        }
    }

    /// Gets the identity of the service this target represents.
    pub fn service(&self) -> &ServiceIdentity {
        &self.service
    }

    /// Gets the local application object of this target.
    pub fn invoker(&self) -> &Arc<dyn ServiceInvoker> {
        &self.invoker
    }

    /// Gets a shared handle to the current view.
    pub fn current_view(&self) -> Arc<ReplicantView> {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.view.clone()
    }

    /// Gets the current view version.
    pub fn view_id(&self) -> ViewId {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.view.view_id()
    }

    /// Gets the current authorization state.
    pub fn auth_state(&self) -> AuthorizationState {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.auth
    }

    /// Returns whether new invocations may be dispatched to this target.
    pub fn invocations_allowed(&self) -> bool {
        self.auth_state() == AuthorizationState::Enabled
    }

    /// Returns whether `destroy()` has run.
    pub fn is_destroyed(&self) -> bool {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        inner.destroyed
    }

    /// Reads the authorization state and the current view under one guard.
    /// The dispatcher uses this so that a disable can never be observed
    /// interleaved with a view from before it.
    pub(crate) fn auth_and_view(
        &self,
    ) -> (AuthorizationState, Arc<ReplicantView>) {
        let inner = self.inner.read().unwrap_or_else(|p| p.into_inner());
        (inner.auth, inner.view.clone())
    }

    /// Applies a membership view update delivered by the directory. Updates
    /// whose version is not strictly greater than the current one are
    /// dropped (the directory delivers at-least-once, so duplicates and
    /// reordered stragglers are expected, not errors). Returns whether the
    /// update was accepted.
    ///
    /// On acceptance the view is swapped wholesale and all registered
    /// listeners are invoked synchronously; a listener failure is logged and
    /// never blocks the update or the remaining listeners.
    pub fn apply_view_update(
        &self,
        endpoints: Vec<Endpoint>,
        view_id: ViewId,
    ) -> bool {
        let (new_view, listeners) = {
            let mut inner =
                self.inner.write().unwrap_or_else(|p| p.into_inner());
            if inner.destroyed {
                pf_debug!(
                    "view update {} for destroyed target '{}' dropped",
                    view_id,
                    self.service
                );
                return false;
            }
            if view_id <= inner.view.view_id() {
                pf_debug!(
                    "stale view update {} <= {} for '{}' dropped",
                    view_id,
                    inner.view.view_id(),
                    self.service
                );
                return false;
            }

            let new_view = Arc::new(ReplicantView::new(
                self.service.clone(),
                endpoints,
                view_id,
            ));
            inner.view = new_view.clone();
            (new_view, inner.listeners.clone())
        };

        pf_info!(
            "target '{}' now at view {} with {} endpoint(s)",
            self.service,
            new_view.view_id(),
            new_view.len()
        );
        // listeners run outside the lock; a re-entrant read cannot deadlock
        for listener in listeners {
            if let Err(e) = listener(&self.service, &new_view) {
                pf_warn!(
                    "view listener for '{}' failed: {}",
                    self.service,
                    e
                );
            }
        }
        true
    }

    /// Transitions the authorization state. Ignored (logged) once the target
    /// has been destroyed.
    pub fn set_authorization(&self, state: AuthorizationState) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if inner.destroyed {
            pf_warn!(
                "authorization change to {:?} on destroyed target '{}' \
                 ignored",
                state,
                self.service
            );
            return;
        }
        if inner.auth != state {
            pf_info!(
                "target '{}' authorization {:?} -> {:?}",
                self.service,
                inner.auth,
                state
            );
            inner.auth = state;
        }
    }

    /// Registers a view replacement listener. Ignored once destroyed.
    pub fn add_listener(&self, listener: ViewListener) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if inner.destroyed {
            pf_warn!(
                "listener registration on destroyed target '{}' ignored",
                self.service
            );
            return;
        }
        inner.listeners.push(listener);
    }

    /// Destroys this target: forces Disabled, clears listeners, and pins the
    /// state so no later transition can re-enable it. Idempotent.
    pub fn destroy(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if inner.destroyed {
            return;
        }
        inner.auth = AuthorizationState::Disabled;
        inner.destroyed = true;
        inner.listeners.clear();
        pf_info!("target '{}' destroyed", self.service);
    }
}

#[cfg(test)]
mod target_tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::server::InvocationContext;

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

    fn new_target(auth: AuthorizationState) -> ClusteredTarget {
        ClusteredTarget::new(
            ServiceIdentity::new("echo"),
            endpoint(52700),
            auth,
            Arc::new(NullInvoker),
        )
    }

    #[test]
    fn initial_view_is_singleton() {
        let target = new_target(AuthorizationState::Waiting);
        assert_eq!(target.view_id(), 0);
        assert_eq!(target.current_view().endpoints(), &[endpoint(52700)]);
        assert!(!target.invocations_allowed());
    }

    #[test]
    fn stale_and_duplicate_updates_dropped() {
        let target = new_target(AuthorizationState::Enabled);
        assert!(target
            .apply_view_update(vec![endpoint(1), endpoint(2)], 2));
        // duplicate
        assert!(!target
            .apply_view_update(vec![endpoint(1), endpoint(2)], 2));
        // out-of-order straggler
        assert!(!target.apply_view_update(vec![endpoint(1)], 1));
        // regardless of delivery order, highest view wins
        assert_eq!(target.view_id(), 2);
        assert_eq!(
            target.current_view().endpoints(),
            &[endpoint(1), endpoint(2)]
        );
    }

    #[test]
    fn view_id_monotonic_over_updates() {
        let target = new_target(AuthorizationState::Enabled);
        let deliveries = [3u64, 1, 4, 4, 2, 9, 5];
        let mut last_seen = target.view_id();
        for view_id in deliveries {
            target.apply_view_update(vec![endpoint(1)], view_id);
            assert!(target.view_id() >= last_seen);
            last_seen = target.view_id();
        }
        assert_eq!(target.view_id(), 9);
    }

    #[test]
    fn listeners_notified_and_isolated() {
        let target = new_target(AuthorizationState::Enabled);
        let notified = Arc::new(AtomicUsize::new(0));

        // first listener always fails; must not block the second one
        target.add_listener(Arc::new(|_, _| {
            Err(ReplicallError::msg("rebind blew up"))
        }));
        let notified_ref = notified.clone();
        target.add_listener(Arc::new(move |service, view| {
            assert_eq!(service.as_str(), "echo");
            assert_eq!(view.view_id(), 1);
            notified_ref.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        assert!(target.apply_view_update(vec![endpoint(1)], 1));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn destroy_is_terminal_and_idempotent() {
        let target = new_target(AuthorizationState::Enabled);
        assert!(target.invocations_allowed());

        target.destroy();
        assert!(target.is_destroyed());
        assert!(!target.invocations_allowed());

        // no transition can re-enable a destroyed target
        target.set_authorization(AuthorizationState::Enabled);
        assert!(!target.invocations_allowed());

        // updates and listeners are ignored now
        assert!(!target.apply_view_update(vec![endpoint(1)], 5));
        target.add_listener(Arc::new(|_, _| Ok(())));

        // second destroy is a no-op
        target.destroy();
        assert!(target.is_destroyed());
    }

    #[test]
    fn disable_before_new_dispatch() {
        let target = new_target(AuthorizationState::Enabled);
        target.set_authorization(AuthorizationState::Disabled);
        let (auth, view) = target.auth_and_view();
        assert_eq!(auth, AuthorizationState::Disabled);
        assert_eq!(view.view_id(), 0);
    }
}
