//! Types used by server-side request handlers.

use std::future::Future;
use std::pin::Pin;

use crate::wire::RpcId;

/// Request handler function return type.
pub(crate) type ReqHandlerFuture = Pin<Box<dyn Future<Output = Vec<u8>> + 'static>>;

/// Request handler function trait.
///
/// The handler receives a complete inbound request and resolves to the
/// response bytes. It runs on the dispatch thread; handlers that cannot
/// return immediately are parked and re-polled on every transport poll.
pub(crate) type ReqHandler = Box<dyn Fn(Request) -> ReqHandlerFuture + 'static>;

/// A complete inbound request, handed to the registered request handler.
pub struct Request {
    rpc_id: RpcId,
    payload: Vec<u8>,
}

impl Request {
    #[inline(always)]
    pub(crate) fn new(rpc_id: RpcId, payload: Vec<u8>) -> Self {
        Self { rpc_id, payload }
    }

    /// Identifier of the RPC this request belongs to.
    #[inline(always)]
    pub fn rpc_id(&self) -> RpcId {
        self.rpc_id
    }

    /// The request bytes.
    #[inline(always)]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take ownership of the request bytes.
    #[inline(always)]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// A handler invocation that could not complete immediately.
pub(crate) struct PendingHandler {
    /// RPC the eventual response belongs to.
    pub rpc_id: RpcId,

    /// Handler body.
    pub handler: ReqHandlerFuture,
}

impl PendingHandler {
    #[inline]
    pub fn new(rpc_id: RpcId, handler: ReqHandlerFuture) -> Self {
        Self { rpc_id, handler }
    }
}
