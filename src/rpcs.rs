//! Per-RPC state for both ends of the transport.

use crate::accumulator::MessageAccumulator;
use crate::driver::Driver;
use crate::outgoing::OutgoingMessage;
use crate::sched::ScheduledMessage;
use crate::session::RpcNotifier;
use crate::type_alias::*;
use crate::wire::RpcId;

/// State of an RPC for which we are the client: an outgoing request bound to
/// its (eventually) incoming response. Lives in the transport's outgoing-RPC
/// map, keyed by sequence, until the response is fully received or the RPC
/// fails.
pub(crate) struct ClientRpc<D: Driver> {
    /// Session this RPC was issued on.
    pub session_id: usize,

    /// Unique identifier for this RPC.
    pub rpc_id: RpcId,

    /// Address of the target server.
    pub server_address: D::Address,

    /// Request message being transmitted.
    pub request: OutgoingMessage,

    /// Caller-provided buffer that will hold the response. Taken by the
    /// accumulator once the first response packet arrives.
    pub response: Option<Vec<u8>>,

    /// Signaled exactly once with the RPC outcome.
    pub notifier: Option<Box<dyn RpcNotifier>>,

    /// Reassembly state for a multi-packet response.
    pub accumulator: Option<MessageAccumulator<D::Packet>>,

    /// Grant-scheduling state for a response that requires scheduling.
    pub scheduled: Option<ScheduledMessage>,

    /// Timer ticks since we last heard from the server.
    pub silent_intervals: u32,

    /// True while the request has not yet been fully transmitted for the
    /// first time (and this RPC is listed among the outgoing requests).
    pub transmit_pending: bool,
}

/// State of an RPC for which we are the server. Created on the first
/// received packet of a new request; dismissed only after the entire
/// response has been handed to the driver.
pub(crate) struct ServerRpc<D: Driver> {
    /// Uniquely identifies this RPC among all RPCs ever received by this
    /// server. This is the server's sequence number; the client's is in
    /// `rpc_id`.
    pub sequence: Sequence,

    /// Unique identifier for this RPC.
    pub rpc_id: RpcId,

    /// Address of the client.
    pub client_address: D::Address,

    /// Reassembly state for a multi-packet request.
    pub accumulator: Option<MessageAccumulator<D::Packet>>,

    /// Grant-scheduling state for a request that requires scheduling.
    pub scheduled: Option<ScheduledMessage>,

    /// Response message; present once the request handler has produced it.
    pub response: Option<OutgoingMessage>,

    /// Timer ticks since we last heard from the client.
    pub silent_intervals: u32,

    /// True once the entire request has been received.
    pub request_complete: bool,

    /// True once we have started sending the response.
    pub sending_response: bool,

    /// True while the timer monitors this RPC. The timer watches RPCs that
    /// are receiving their request or sending their response, but not ones
    /// being executed.
    pub in_timer_list: bool,
}

impl<D: Driver> ServerRpc<D> {
    pub fn new(sequence: Sequence, rpc_id: RpcId, client_address: D::Address) -> Self {
        Self {
            sequence,
            rpc_id,
            client_address,
            accumulator: None,
            scheduled: None,
            response: None,
            silent_intervals: 0,
            request_complete: false,
            sending_response: false,
            in_timer_list: false,
        }
    }
}
