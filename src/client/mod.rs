//! Replicall's client-side functionality modules.

mod apistub;
mod proxy;
mod transport;

pub use apistub::{ClientApiStub, ClientId};
pub use proxy::{ClientConfigProxy, ClientProxy};
pub use transport::{CallTransport, TcpCallTransport};
