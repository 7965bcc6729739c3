//! Call transport abstraction between the client proxy and the wire, plus
//! the TCP implementation over per-endpoint API stubs.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;

use crate::client::{ClientApiStub, ClientId};
use crate::cluster::Endpoint;
use crate::server::{ApiReply, ApiRequest, CallReply, CallRequest, RequestId};
use crate::utils::ReplicallError;

/// Transport seam used by the client proxy to carry one call attempt to one
/// chosen endpoint. Any `Err` from `call()` means the endpoint could not
/// serve the attempt at the transport level; the proxy reacts by marking it
/// suspect and failing over.
#[async_trait]
pub trait CallTransport: Send {
    /// Carries one call to given endpoint and awaits its reply envelope.
    async fn call(
        &mut self,
        endpoint: &Endpoint,
        id: RequestId,
        call: CallRequest,
    ) -> Result<CallReply, ReplicallError>;

    /// Tears down any cached connection state for given endpoint. Called by
    /// the proxy after a failed or timed-out attempt so that a later retry
    /// starts from a fresh connection.
    fn invalidate(&mut self, endpoint: &Endpoint);
}

/// TCP call transport: lazily opens and caches one API stub per endpoint.
pub struct TcpCallTransport {
    /// My client ID, sent as the connection hello.
    id: ClientId,

    /// Map from endpoint -> established API stub.
    stubs: HashMap<Endpoint, ClientApiStub>,
}

impl TcpCallTransport {
    /// Creates a new TCP call transport for given client ID.
    pub fn new(id: ClientId) -> Self {
        TcpCallTransport {
            id,
            stubs: HashMap::new(),
        }
    }

    /// Gets my client ID.
    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Runs one request/reply exchange on an established stub. Replies with
    /// a mismatched ID (left over from an earlier abandoned attempt on this
    /// connection) are dropped until the matching one arrives.
    async fn call_on_stub(
        stub: &mut ClientApiStub,
        id: RequestId,
        call: CallRequest,
    ) -> Result<CallReply, ReplicallError> {
        let req = ApiRequest::Call { id, call };
        let mut sent = stub.send_req(Some(&req))?;
        while !sent {
            sent = stub.send_req(None)?;
        }

        loop {
            match stub.recv_reply().await? {
                ApiReply::Call { id: reply_id, reply } if reply_id == id => {
                    return Ok(reply);
                }
                ApiReply::Call { id: reply_id, .. } => {
                    pf_debug!("dropping stale reply {}", reply_id);
                }
                ApiReply::Leave => {
                    return Err(ReplicallError::msg(
                        "unexpected leave reply on call connection",
                    ));
                }
            }
        }
    }

    /// Sends leave notifications on all established connections and drops
    /// them. Best-effort graceful teardown.
    pub async fn leave(&mut self) {
        for (endpoint, mut stub) in self.stubs.drain() {
            let mut sent = match stub.send_req(Some(&ApiRequest::Leave)) {
                Ok(sent) => sent,
                Err(e) => {
                    pf_warn!("error leaving server {}: {}", endpoint, e);
                    continue;
                }
            };
            while !sent {
                sent = match stub.send_req(None) {
                    Ok(sent) => sent,
                    Err(_) => break,
                };
            }
            match stub.recv_reply().await {
                Ok(ApiReply::Leave) => {
                    pf_debug!("left server connection {}", endpoint);
                }
                Ok(_) | Err(_) => {
                    pf_warn!("no leave ack from server {}", endpoint);
                }
            }
        }
    }
}

#[async_trait]
impl CallTransport for TcpCallTransport {
    async fn call(
        &mut self,
        endpoint: &Endpoint,
        id: RequestId,
        call: CallRequest,
    ) -> Result<CallReply, ReplicallError> {
        let stub = match self.stubs.entry(endpoint.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(
                ClientApiStub::new_by_connect(self.id, endpoint.addr())
                    .await?,
            ),
        };

        let result = Self::call_on_stub(stub, id, call).await;
        if result.is_err() {
            // connection state is unreliable after a failed exchange
            self.stubs.remove(endpoint);
        }
        result
    }

    fn invalidate(&mut self, endpoint: &Endpoint) {
        if self.stubs.remove(endpoint).is_some() {
            pf_debug!("invalidated connection to {}", endpoint);
        }
    }
}

// Unit tests are done together with `client::proxy` (mock transport) and
// `server::external` (TCP round trips).
