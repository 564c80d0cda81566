//! Client-side session surface: issuing, awaiting and cancelling RPCs.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use thiserror::Error;

use crate::driver::Driver;
use crate::transport::HomaTransport;
use crate::type_alias::*;

/// User-visible RPC failure kinds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// No packets from the peer for the configured number of timer ticks.
    #[error("RPC timed out waiting for the peer")]
    Timeout,

    /// The session was aborted, failing all of its RPCs.
    #[error("session aborted")]
    SessionAborted,

    /// The RPC was cancelled locally.
    #[error("RPC cancelled")]
    Cancelled,

    /// The transport could not carry the RPC.
    #[error("transport failure: {0}")]
    Failed(String),
}

/// The single channel through which RPC outcomes surface.
///
/// Implementations are invoked on the dispatch thread, exactly once per RPC.
pub trait RpcNotifier {
    /// The RPC completed; `response` holds the full response message.
    fn completed(&mut self, response: Vec<u8>);

    /// The RPC failed or was cancelled.
    fn failed(&mut self, error: RpcError);
}

/// Handle to a session grouping RPCs to one remote transport.
///
/// Handles are cheap to copy and may outlive the RPCs issued on them; the
/// session itself lives for the lifetime of the transport.
pub struct SessionHandle<'t, D: Driver> {
    transport: &'t HomaTransport<D>,
    sess_id: usize,
}

impl<D: Driver> Clone for SessionHandle<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: Driver> Copy for SessionHandle<'_, D> {}

impl<'t, D: Driver> SessionHandle<'t, D> {
    #[inline(always)]
    pub(crate) fn new(transport: &'t HomaTransport<D>, sess_id: usize) -> Self {
        Self { transport, sess_id }
    }

    /// Return the transport that owns this session.
    #[inline(always)]
    pub fn transport(&self) -> &'t HomaTransport<D> {
        self.transport
    }

    /// Issue an RPC on this session.
    ///
    /// `request` holds the request message; `response` is a buffer whose
    /// storage is reused for the response. The notifier is signaled exactly
    /// once, on completion, failure or cancellation. Returns the sequence
    /// number identifying the RPC within this transport.
    pub fn send_request(
        &self,
        request: Vec<u8>,
        response: Vec<u8>,
        notifier: Box<dyn RpcNotifier>,
    ) -> Sequence {
        self.transport
            .issue_request(self.sess_id, request, response, notifier)
    }

    /// Issue an RPC and await the response.
    ///
    /// Polling the returned future drives the owning transport, so blocking
    /// on it from the dispatch thread makes progress by itself.
    pub fn request(&self, request: Vec<u8>) -> RequestFuture<'t, D> {
        let slot: ResponseSlot = Rc::new(RefCell::new(None));
        let sequence = self.transport.issue_request(
            self.sess_id,
            request,
            Vec::new(),
            Box::new(FutureNotifier(slot.clone())),
        );
        RequestFuture {
            transport: self.transport,
            slot,
            sequence,
        }
    }

    /// Cancel an outstanding RPC issued on this session. The server is told
    /// to drop its state; the RPC's notifier fails with
    /// [`RpcError::Cancelled`]. A no-op if the RPC already finished.
    pub fn cancel_request(&self, sequence: Sequence) {
        self.transport.cancel_request(self.sess_id, sequence);
    }

    /// Fail every outstanding RPC on this session with
    /// [`RpcError::SessionAborted`] and refuse new ones.
    pub fn abort(&self) {
        self.transport.abort_session(self.sess_id);
    }

    /// Diagnostic summary of the RPCs outstanding on this session.
    pub fn rpc_info(&self) -> String {
        self.transport.rpc_info(self.sess_id)
    }
}

type ResponseSlot = Rc<RefCell<Option<Result<Vec<u8>, RpcError>>>>;

/// Internal notifier bridging completions into a [`RequestFuture`].
struct FutureNotifier(ResponseSlot);

impl RpcNotifier for FutureNotifier {
    fn completed(&mut self, response: Vec<u8>) {
        *self.0.borrow_mut() = Some(Ok(response));
    }

    fn failed(&mut self, error: RpcError) {
        *self.0.borrow_mut() = Some(Err(error));
    }
}

/// Awaitable RPC created by [`SessionHandle::request`].
pub struct RequestFuture<'t, D: Driver> {
    transport: &'t HomaTransport<D>,
    slot: ResponseSlot,
    sequence: Sequence,
}

impl<D: Driver> RequestFuture<'_, D> {
    /// Sequence number of the underlying RPC, usable with
    /// [`SessionHandle::cancel_request`].
    #[inline(always)]
    pub fn sequence(&self) -> Sequence {
        self.sequence
    }
}

impl<D: Driver> Future for RequestFuture<'_, D> {
    type Output = Result<Vec<u8>, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.slot.borrow_mut().take() {
            return Poll::Ready(result);
        }

        self.transport.poll();
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
