//! Server external invocation API module: accepts client proxy connections
//! and feeds inbound calls through the invocation dispatcher.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;

use rmp_serde::encode::to_vec as encode_to_vec;

use serde::{Deserialize, Serialize};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::WriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::client::ClientId;
use crate::server::{
    CallReply, CallRequest, InvocationContext, InvocationDispatcher,
    RequestId,
};
use crate::utils::{safe_tcp_read, tcp_bind_with_retry, ReplicallError};

/// Request received from a client proxy.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    /// Regular invocation request.
    Call {
        /// Client-assigned request ID.
        id: RequestId,

        /// Invocation envelope.
        call: CallRequest,
    },

    /// Client leave notification.
    Leave,
}

/// Reply back to a client proxy.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    /// Reply to a regular invocation request.
    Call {
        /// ID of the corresponding request.
        id: RequestId,

        /// Reply envelope.
        reply: CallReply,
    },

    /// Reply to a client leave notification.
    Leave,
}

/// The external client-facing invocation API module.
pub struct InvocationApi {
    /// Join handle of the client acceptor task.
    _client_acceptor_handle: JoinHandle<()>,

    /// Map from client ID -> client servant task join handles, shared with
    /// the client acceptor task.
    client_servant_handles: flashmap::ReadHandle<ClientId, JoinHandle<()>>,
}

// InvocationApi public API implementation
impl InvocationApi {
    /// Creates a new invocation API module: binds the client listener and
    /// spawns the client acceptor task. Each accepted connection gets its
    /// own servant task that runs calls through given dispatcher.
    pub async fn new_and_setup(
        dispatcher: Arc<InvocationDispatcher>,
        api_addr: SocketAddr,
    ) -> Result<Self, ReplicallError> {
        let client_listener = tcp_bind_with_retry(api_addr, 10).await?;

        let (client_servant_handles_write, client_servant_handles_read) =
            flashmap::new::<ClientId, JoinHandle<()>>();

        let client_acceptor_handle = tokio::spawn(Self::client_acceptor_task(
            dispatcher,
            client_listener,
            client_servant_handles_write,
        ));

        Ok(InvocationApi {
            _client_acceptor_handle: client_acceptor_handle,
            client_servant_handles: client_servant_handles_read,
        })
    }

    /// Returns whether a client ID currently has a live connection to me.
    pub fn has_client(&self, client: ClientId) -> bool {
        let handles_guard = self.client_servant_handles.guard();
        matches!(handles_guard.get(&client), Some(h) if !h.is_finished())
    }
}

// InvocationApi client_acceptor task implementation
impl InvocationApi {
    /// Client acceptor task function.
    async fn client_acceptor_task(
        dispatcher: Arc<InvocationDispatcher>,
        client_listener: TcpListener,
        mut client_servant_handles: flashmap::WriteHandle<
            ClientId,
            JoinHandle<()>,
        >,
    ) {
        pf_debug!("client_acceptor task spawned");

        let local_addr = match client_listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                pf_error!("error getting listener local addr: {}", e);
                return;
            }
        };
        pf_info!("accepting clients on '{}'", local_addr);

        loop {
            let accepted = client_listener.accept().await;
            if let Err(e) = accepted {
                pf_warn!("error accepting client connection: {}", e);
                continue;
            }
            let (mut stream, addr) = accepted.unwrap();

            let id = stream.read_u64().await; // receive client ID
            if let Err(e) = id {
                pf_error!("error receiving new client ID: {}", e);
                continue;
            }
            let id = id.unwrap();

            let mut duplicate = false;
            {
                let mut handles_guard = client_servant_handles.guard();
                if let Some(handle) = handles_guard.get(&id) {
                    if handle.is_finished() {
                        // this client ID has left before; garbage collect
                        handles_guard.remove(id);
                    } else {
                        duplicate = true;
                    }
                }
                handles_guard.publish();
            }
            if duplicate {
                pf_error!("duplicate client ID listened: {}", id);
                continue;
            }
            pf_info!("accepted new client {}", id);

            let client_servant_handle =
                tokio::spawn(Self::client_servant_task(
                    dispatcher.clone(),
                    id,
                    addr,
                    stream,
                ));

            let mut handles_guard = client_servant_handles.guard();
            handles_guard.insert(id, client_servant_handle);
            handles_guard.publish();
        }
    }
}

// InvocationApi client_servant task implementation
impl InvocationApi {
    /// Writes a reply through given TcpStream write half.
    async fn write_reply(
        reply: &ApiReply,
        conn_write: &mut WriteHalf<'_>,
    ) -> Result<(), ReplicallError> {
        let reply_bytes = encode_to_vec(reply)?;
        conn_write.write_u64(reply_bytes.len() as u64).await?; // length first
        conn_write.write_all(&reply_bytes[..]).await?;
        Ok(())
    }

    /// Client request listener and reply sender task function. Calls are
    /// served in order per connection; each one runs to completion through
    /// the dispatcher before the next is read.
    async fn client_servant_task(
        dispatcher: Arc<InvocationDispatcher>,
        id: ClientId,
        addr: SocketAddr,
        mut conn: TcpStream,
    ) {
        pf_debug!("client_servant task for {} ({}) spawned", id, addr);

        let (mut conn_read, mut conn_write) = conn.split();
        let mut req_buf = BytesMut::with_capacity(8 + 1024);

        loop {
            match safe_tcp_read(&mut req_buf, &mut conn_read).await {
                // client leaving, send dummy reply and break
                Ok(ApiRequest::Leave) => {
                    let reply = ApiReply::Leave;
                    if let Err(e) =
                        Self::write_reply(&reply, &mut conn_write).await
                    {
                        pf_error!("error replying to {}: {}", id, e);
                    } else {
                        pf_info!("client {} has left", id);
                    }
                    break;
                }

                Ok(ApiRequest::Call { id: req_id, call }) => {
                    let ctx = InvocationContext {
                        client: id,
                        request: req_id,
                    };
                    let reply = dispatcher.dispatch(ctx, call).await;
                    if let Err(e) = Self::write_reply(
                        &ApiReply::Call { id: req_id, reply },
                        &mut conn_write,
                    )
                    .await
                    {
                        pf_error!("error replying to {}: {}", id, e);
                    }
                }

                Err(e) => {
                    pf_error!("error reading request from {}: {}", id, e);
                    break; // probably the client exited without `leave()`
                }
            }
        }

        pf_debug!("client_servant task for {} ({}) exited", id, addr);
    }
}
