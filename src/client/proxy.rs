//! Client-side call proxy: cached replicant view, load-balanced endpoint
//! selection, transparent failover, and lazy piggybacked view refresh.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;

use serde::Deserialize;

use tokio::time::{self, Duration};

use crate::client::{CallTransport, ClientId, TcpCallTransport};
use crate::cluster::{
    BalancePolicyKind, Endpoint, LoadBalancePolicy, ReplicantView,
    ServiceIdentity,
};
use crate::server::{CallFault, CallReply, CallRequest, RequestId};
use crate::utils::ReplicallError;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfigProxy {
    /// Per-attempt call timeout in millisecs.
    pub attempt_timeout_ms: u64,

    /// Maximum failover retries after the initial attempt of a call.
    pub max_failovers: u32,
}

impl Default for ClientConfigProxy {
    fn default() -> Self {
        ClientConfigProxy {
            attempt_timeout_ms: 2000,
            max_failovers: 1,
        }
    }
}

/// Cached cluster knowledge of one proxy: the last known replicant view plus
/// the endpoints found unreachable since that view was installed. Updated
/// only from reply envelopes; the proxy never joins the directory's
/// notification channel.
struct ClientViewCache {
    /// Last known replicant view.
    view: Arc<ReplicantView>,

    /// Endpoints considered unreachable until the next view refresh.
    suspects: HashSet<Endpoint>,
}

/// Client-side call proxy for one logical clustered service.
pub struct ClientProxy<T> {
    /// Identity of the service this proxy calls.
    service: ServiceIdentity,

    /// Configuration parameters struct.
    config: ClientConfigProxy,

    /// Load balance policy picking an endpoint per call.
    policy: Box<dyn LoadBalancePolicy>,

    /// Transport carrying call attempts to endpoints.
    transport: T,

    /// Cached view and suspect set.
    cache: ClientViewCache,

    /// Monotonic request ID counter.
    next_req: RequestId,
}

impl ClientProxy<TcpCallTransport> {
    /// Creates a new proxy speaking TCP to the servers, seeded with an
    /// initial endpoint list at view version 0.
    pub fn new_tcp(
        id: ClientId,
        service: ServiceIdentity,
        seeds: Vec<Endpoint>,
        policy_kind: BalancePolicyKind,
        config_str: Option<&str>,
    ) -> Result<Self, ReplicallError> {
        Self::new_with_transport(
            service,
            seeds,
            policy_kind,
            TcpCallTransport::new(id),
            config_str,
        )
    }

    /// Gracefully leaves all established server connections.
    pub async fn leave(&mut self) {
        self.transport.leave().await;
    }
}

impl<T: CallTransport> ClientProxy<T> {
    /// Creates a new proxy over given transport, seeded with an initial
    /// endpoint list at view version 0.
    pub fn new_with_transport(
        service: ServiceIdentity,
        seeds: Vec<Endpoint>,
        policy_kind: BalancePolicyKind,
        transport: T,
        config_str: Option<&str>,
    ) -> Result<Self, ReplicallError> {
        let config = parsed_config!(config_str => ClientConfigProxy;
                                    attempt_timeout_ms, max_failovers)?;
        if config.attempt_timeout_ms == 0 {
            return logged_err!(
                "invalid config.attempt_timeout_ms '{}'",
                config.attempt_timeout_ms
            );
        }
        if seeds.is_empty() {
            return logged_err!("no seed endpoints given for '{}'", service);
        }

        let view = Arc::new(ReplicantView::new(service.clone(), seeds, 0));
        Ok(ClientProxy {
            service,
            config,
            policy: policy_kind.new_policy(),
            transport,
            cache: ClientViewCache {
                view,
                suspects: HashSet::new(),
            },
            next_req: 0,
        })
    }

    /// Gets a shared handle to the currently cached view.
    pub fn cached_view(&self) -> Arc<ReplicantView> {
        self.cache.view.clone()
    }

    /// Absorbs a piggybacked view refresh from a reply envelope, if any.
    /// The cached view is replaced wholesale (never merged) and the suspect
    /// set starts over.
    fn absorb_reply_view(&mut self, reply: &CallReply) {
        if let (Some(view_id), Some(endpoints)) =
            (reply.server_view_id, reply.new_endpoints.clone())
        {
            pf_debug!(
                "view of '{}' refreshed {} -> {} ({} endpoint(s))",
                self.service,
                self.cache.view.view_id(),
                view_id,
                endpoints.len()
            );
            self.cache.view = Arc::new(ReplicantView::new(
                self.service.clone(),
                endpoints,
                view_id,
            ));
            self.cache.suspects.clear();
        }
    }

    /// Marks an endpoint suspect after a failed attempt. Returns the error
    /// the call should end with if no further attempt is possible: running
    /// out of endpoints wins over running out of attempts.
    fn note_failure(
        &mut self,
        endpoint: Endpoint,
        attempts_left: u32,
        last_err: ReplicallError,
    ) -> Option<ReplicallError> {
        self.cache.suspects.insert(endpoint);
        if self
            .cache
            .view
            .without(&self.cache.suspects)
            .is_empty()
        {
            return Some(ReplicallError::NoEndpointAvailable(
                self.service.to_string(),
            ));
        }
        if attempts_left == 0 {
            return Some(last_err);
        }
        None
    }

    /// Invokes a method of the clustered service. Picks an endpoint through
    /// the load balance policy, carries the call with a bounded per-attempt
    /// timeout, and fails over to the next endpoint (over the remaining
    /// view, no directory round-trip) when the attempt fails at transport or
    /// routing level. Application faults come back unmodified and are never
    /// retried by this layer.
    pub async fn invoke(
        &mut self,
        method: &str,
        args: Bytes,
        affinity: Option<&str>,
    ) -> Result<Bytes, ReplicallError> {
        let mut attempts_left = 1 + self.config.max_failovers;
        let attempt_timeout =
            Duration::from_millis(self.config.attempt_timeout_ms);

        loop {
            let candidates = self.cache.view.without(&self.cache.suspects);
            let endpoint = self.policy.select(&candidates, affinity)?;

            let id = self.next_req;
            self.next_req += 1;
            let call = CallRequest {
                service: self.service.clone(),
                method: method.into(),
                args: args.clone(),
                client_view_id: self.cache.view.view_id(),
            };

            let attempt = match time::timeout(
                attempt_timeout,
                self.transport.call(&endpoint, id, call),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ReplicallError::msg(format!(
                    "attempt to {} timed out",
                    endpoint
                ))),
            };
            attempts_left -= 1;

            match attempt {
                Ok(reply) => {
                    // refresh the cached view before judging the outcome, so
                    // a failover re-selects over the freshest knowledge
                    self.absorb_reply_view(&reply);
                    match reply.outcome {
                        Ok(result) => return Ok(result),
                        Err(CallFault::Application(payload)) => {
                            return Err(ReplicallError::Application(payload));
                        }
                        Err(CallFault::Routing { reason }) => {
                            pf_warn!(
                                "routing fault from {}: {}",
                                endpoint,
                                reason
                            );
                            if let Some(e) = self.note_failure(
                                endpoint,
                                attempts_left,
                                ReplicallError::Routing(reason),
                            ) {
                                return Err(e);
                            }
                        }
                    }
                }
                Err(e) => {
                    pf_warn!("endpoint {} unreachable: {}", endpoint, e);
                    self.transport.invalidate(&endpoint);
                    if let Some(e) =
                        self.note_failure(endpoint, attempts_left, e)
                    {
                        return Err(e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod proxy_tests {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use async_trait::async_trait;

    /// Scripted behavior of one mock call attempt.
    enum MockBehavior {
        Reply(CallReply),
        Disconnect,
        Hang,
    }

    /// Mock transport replaying scripted behaviors per endpoint.
    struct MockTransport {
        scripts: HashMap<Endpoint, VecDeque<MockBehavior>>,
        calls: Arc<Mutex<Vec<Endpoint>>>,
    }

    impl MockTransport {
        fn new() -> (Self, Arc<Mutex<Vec<Endpoint>>>) {
            let calls = Arc::new(Mutex::new(vec![]));
            (
                MockTransport {
                    scripts: HashMap::new(),
                    calls: calls.clone(),
                },
                calls,
            )
        }

        fn script(
            mut self,
            endpoint: &Endpoint,
            behaviors: Vec<MockBehavior>,
        ) -> Self {
            self.scripts
                .entry(endpoint.clone())
                .or_default()
                .extend(behaviors);
            self
        }
    }

    #[async_trait]
    impl CallTransport for MockTransport {
        async fn call(
            &mut self,
            endpoint: &Endpoint,
            _id: RequestId,
            _call: CallRequest,
        ) -> Result<CallReply, ReplicallError> {
            self.calls.lock().unwrap().push(endpoint.clone());
            match self
                .scripts
                .get_mut(endpoint)
                .and_then(|queue| queue.pop_front())
            {
                Some(MockBehavior::Reply(reply)) => Ok(reply),
                Some(MockBehavior::Disconnect) => {
                    Err(ReplicallError::msg("connection reset"))
                }
                Some(MockBehavior::Hang) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                None => Err(ReplicallError::msg("no scripted behavior")),
            }
        }

        fn invalidate(&mut self, _endpoint: &Endpoint) {}
    }

    fn endpoint(port: u16) -> Endpoint {
        Endpoint::new(([127, 0, 0, 1], port).into())
    }

    fn ok_reply(payload: &'static [u8]) -> CallReply {
        CallReply {
            outcome: Ok(Bytes::from_static(payload)),
            server_view_id: Some(0),
            new_endpoints: None,
        }
    }

    fn routing_reply() -> CallReply {
        CallReply {
            outcome: Err(CallFault::Routing {
                reason: "invocations not currently allowed".into(),
            }),
            server_view_id: Some(0),
            new_endpoints: None,
        }
    }

    fn new_proxy(
        seeds: Vec<Endpoint>,
        transport: MockTransport,
        config_str: Option<&str>,
    ) -> ClientProxy<MockTransport> {
        ClientProxy::new_with_transport(
            ServiceIdentity::new("echo"),
            seeds,
            BalancePolicyKind::FirstAvailable,
            transport,
            config_str,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn failover_to_next_endpoint() -> Result<(), ReplicallError> {
        let (a, b) = (endpoint(1), endpoint(2));
        let (transport, calls) = MockTransport::new();
        let transport = transport
            .script(&a, vec![MockBehavior::Disconnect])
            .script(&b, vec![MockBehavior::Reply(ok_reply(b"pong"))]);
        let mut proxy = new_proxy(vec![a.clone(), b.clone()], transport, None);

        let result = proxy.invoke("echo", Bytes::from_static(b"ping"), None);
        assert_eq!(result.await?, Bytes::from_static(b"pong"));

        // one attempt on each endpoint, no directory involved anywhere
        assert_eq!(*calls.lock().unwrap(), vec![a.clone(), b]);
        assert!(proxy.cache.suspects.contains(&a));
        Ok(())
    }

    #[tokio::test]
    async fn failover_on_routing_fault() -> Result<(), ReplicallError> {
        let (a, b) = (endpoint(1), endpoint(2));
        let (transport, calls) = MockTransport::new();
        let transport = transport
            .script(&a, vec![MockBehavior::Reply(routing_reply())])
            .script(&b, vec![MockBehavior::Reply(ok_reply(b"pong"))]);
        let mut proxy = new_proxy(vec![a, b], transport, None);

        let result = proxy
            .invoke("echo", Bytes::from_static(b"ping"), None)
            .await?;
        assert_eq!(result, Bytes::from_static(b"pong"));
        assert_eq!(calls.lock().unwrap().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn application_fault_not_retried() {
        let a = endpoint(1);
        let (transport, calls) = MockTransport::new();
        let transport = transport.script(
            &a,
            vec![MockBehavior::Reply(CallReply {
                outcome: Err(CallFault::Application(Bytes::from_static(
                    b"boom",
                ))),
                server_view_id: Some(0),
                new_endpoints: None,
            })],
        );
        let mut proxy = new_proxy(vec![a], transport, None);

        let result =
            proxy.invoke("echo", Bytes::from_static(b"ping"), None).await;
        assert_eq!(
            result,
            Err(ReplicallError::Application(Bytes::from_static(b"boom")))
        );
        // exactly one attempt; application faults are final
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn all_endpoints_exhausted() {
        let (a, b) = (endpoint(1), endpoint(2));
        let (transport, _calls) = MockTransport::new();
        let transport = transport
            .script(&a, vec![MockBehavior::Disconnect])
            .script(&b, vec![MockBehavior::Disconnect]);
        let mut proxy = new_proxy(vec![a, b], transport, None);

        let result =
            proxy.invoke("echo", Bytes::from_static(b"ping"), None).await;
        assert!(matches!(
            result,
            Err(ReplicallError::NoEndpointAvailable(_))
        ));
    }

    #[tokio::test]
    async fn piggybacked_refresh_replaces_wholesale(
    ) -> Result<(), ReplicallError> {
        let (a, b, c) = (endpoint(1), endpoint(2), endpoint(3));
        let (transport, _calls) = MockTransport::new();
        let transport = transport
            .script(&a, vec![MockBehavior::Disconnect])
            .script(
                &b,
                vec![MockBehavior::Reply(CallReply {
                    outcome: Ok(Bytes::from_static(b"pong")),
                    server_view_id: Some(2),
                    new_endpoints: Some(vec![
                        a.clone(),
                        b.clone(),
                        c.clone(),
                    ]),
                })],
            );
        let mut proxy = new_proxy(vec![a.clone(), b.clone()], transport, None);

        proxy.invoke("echo", Bytes::from_static(b"ping"), None).await?;

        // the cache is exactly the piggybacked list, and the suspicion of A
        // from the failed first attempt has been erased by the refresh
        let view = proxy.cached_view();
        assert_eq!(view.view_id(), 2);
        assert_eq!(view.endpoints(), &[a, b, c]);
        assert!(proxy.cache.suspects.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn timed_out_attempt_fails_over() -> Result<(), ReplicallError> {
        let (a, b) = (endpoint(1), endpoint(2));
        let (transport, calls) = MockTransport::new();
        let transport = transport
            .script(&a, vec![MockBehavior::Hang])
            .script(&b, vec![MockBehavior::Reply(ok_reply(b"pong"))]);
        let mut proxy = new_proxy(
            vec![a.clone(), b.clone()],
            transport,
            Some("attempt_timeout_ms = 20"),
        );

        let result = proxy
            .invoke("echo", Bytes::from_static(b"ping"), None)
            .await?;
        assert_eq!(result, Bytes::from_static(b"pong"));
        assert_eq!(*calls.lock().unwrap(), vec![a, b]);
        Ok(())
    }

    #[tokio::test]
    async fn bad_config_rejected() {
        let (transport, _calls) = MockTransport::new();
        assert!(ClientProxy::new_with_transport(
            ServiceIdentity::new("echo"),
            vec![endpoint(1)],
            BalancePolicyKind::RoundRobin,
            transport,
            Some("attempt_timeout_ms = 0"),
        )
        .is_err());

        let (transport, _calls) = MockTransport::new();
        assert!(ClientProxy::new_with_transport(
            ServiceIdentity::new("echo"),
            vec![],
            BalancePolicyKind::RoundRobin,
            transport,
            None,
        )
        .is_err());
    }
}
