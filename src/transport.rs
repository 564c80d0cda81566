//! The transport state machine: packet dispatch, the receiver-side grant
//! scheduler, SRPT transmit selection and timeout-driven loss recovery.
//!
//! All protocol state lives behind a `RefCell` and is manipulated from the
//! single dispatcher thread that calls [`HomaTransport::poll`]. Each poll
//! runs to completion; there are no suspension points inside the core.
//! Notifier and request-handler invocations are deferred until the interior
//! borrow has been released, so user code may re-enter the transport.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::future::Future;
use std::hash::BuildHasher;
use std::mem;
use std::time::Duration;

use ahash::RandomState;
use futures::future::FutureExt;
use futures::task::noop_waker_ref;
use quanta::{Clock, Instant};

use crate::accumulator::MessageAccumulator;
use crate::config::{Config, PriorityPlan};
use crate::driver::Driver;
use crate::handler::{PendingHandler, ReqHandler, ReqHandlerFuture, Request};
use crate::outgoing::OutgoingMessage;
use crate::rpcs::{ClientRpc, ServerRpc};
use crate::sched::{SchedState, ScheduledMessage};
use crate::session::{RpcError, RpcNotifier, SessionHandle};
use crate::type_alias::*;
use crate::util::likely::*;
use crate::wire::*;

/// Packets drained from the driver per poll iteration.
const MAX_RX_PACKETS: usize = 8;

/// Bound on the top-outgoing fast-path list.
const TOP_OUTGOING_LIMIT: usize = 5;

/// Identifies an outgoing message: the request of a client RPC (keyed by our
/// sequence number) or the response of a server RPC (keyed by its RPC id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) enum OutKey {
    Request(Sequence),
    Response(RpcId),
}

/// Identifies an inbound scheduled message: a request being received on the
/// server side, or a response being received on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedKey {
    Request(RpcId),
    Response(Sequence),
}

/// Direction flag for the control packets (GRANT/RESEND) we send about an
/// inbound message: packets about a request leave the server, packets about
/// a response leave the client.
#[inline(always)]
fn sched_dir_flags(key: SchedKey) -> u8 {
    match key {
        SchedKey::Request(_) => FROM_SERVER,
        SchedKey::Response(_) => FROM_CLIENT,
    }
}

/// Client-side state of one session.
pub(crate) struct SessionState<D: Driver> {
    pub server_address: D::Address,
    pub aborted: bool,

    /// Per-session override of the transport-wide timeout, in timer ticks.
    pub timeout_intervals: Option<u32>,
}

/// A loss-recovery decision made by the timer, executed after the per-RPC
/// borrow is released.
enum TimerAction<A> {
    Abandon,
    Resend {
        peer: A,
        rpc_id: RpcId,
        offset: u32,
        length: u32,
        priority: u8,
        flags: u8,
    },
}

/// Interior-mutable state of a [`HomaTransport`] instance.
struct Inner<D: Driver> {
    /// The driver used to send and receive packets.
    driver: D,

    /// Unique identifier for this client.
    client_id: ClientId,

    // Configuration, resolved against the driver at construction.
    max_data_per_packet: u32,
    round_trip_bytes: u32,
    grant_increment: u32,
    message_zero_copy_threshold: u32,
    small_message_threshold: u32,
    max_granted_messages: u32,
    timeout_intervals: u32,
    ping_intervals: u32,
    timer_interval: Duration,
    prio: PriorityPlan,

    /// Sequence number for the next outgoing RPC.
    next_client_sequence: Sequence,

    /// Sequence number for the next incoming RPC.
    next_server_sequence: Sequence,

    /// Client-side sessions, indexed by session id.
    sessions: Vec<SessionState<D>>,

    /// RPCs for which we are the client and the response has not yet been
    /// completely received. Keyed by our sequence number.
    outgoing_rpcs: HashMap<Sequence, ClientRpc<D>, RandomState>,

    /// RPCs whose request has not yet been fully transmitted for the first
    /// time. A subset of `outgoing_rpcs`.
    outgoing_requests: Vec<Sequence>,

    /// RPCs for which we are the server: at least one request byte received,
    /// last response byte not yet handed to the driver.
    incoming_rpcs: HashMap<RpcId, ServerRpc<D>, RandomState>,

    /// Server RPCs with a partially-transmitted response.
    outgoing_responses: Vec<RpcId>,

    /// Subset of `incoming_rpcs` the timer must monitor: RPCs receiving
    /// their request or sending their response, but not ones being executed.
    server_timer_list: Vec<RpcId>,

    /// The sender's top outgoing messages with the fewest bytes left. The
    /// transmit path normally scans only this list.
    top_outgoing: Vec<OutKey>,

    /// True if a message outside `top_outgoing` may have bytes ready to
    /// transmit, forcing a full rescan when every top entry is stalled.
    transmit_data_slow_path: bool,

    /// Inbound messages currently being granted, sorted by SRPT precedence.
    /// At most `max_granted_messages` entries, all from distinct senders.
    active_messages: Vec<SchedKey>,

    /// Inbound scheduled messages waiting for a grant slot. Unordered.
    inactive_messages: Vec<SchedKey>,

    /// Messages to grant at the end of the current poll iteration.
    messages_to_grant: Vec<SchedKey>,

    /// Receive scratch space, reused across polls.
    rx_scratch: Vec<(D::Address, D::Packet)>,

    /// Notifier outcomes to deliver once the interior borrow is released.
    completions: Vec<(Box<dyn RpcNotifier>, Result<Vec<u8>, RpcError>)>,

    /// Completed inbound requests awaiting dispatch to the handler.
    ready_requests: Vec<Request>,

    /// Hashes sender addresses for the scheduler's distinct-sender rule.
    hasher: RandomState,

    // Timer state.
    next_timeout_check: Instant,
    timeout_check_deadline: Option<Instant>,
}

/// Thread-local transport endpoint multiplexing many concurrent
/// request/response RPCs over an unreliable packet driver.
///
/// The transport is receiver-driven: senders may transmit a round-trip's
/// worth of bytes unilaterally, after which the receiver paces them with
/// GRANT packets, favoring the messages with the fewest bytes remaining.
///
/// An external dispatcher must call [`poll`](Self::poll) repeatedly; each
/// invocation drains received packets, emits grants, transmits data and
/// periodically checks timeouts.
pub struct HomaTransport<D: Driver> {
    /// Unique identifier for this client; must be unique cluster-wide.
    client_id: ClientId,

    /// Timing source for the transmit stamps and the timeout wheel.
    clock: Clock,

    /// Interior-mutable protocol state.
    state: RefCell<Inner<D>>,

    /// Registered server-side request handler.
    ///
    /// Kept outside `state` so handler invocations never contend with the
    /// protocol borrow.
    handler: RefCell<Option<ReqHandler>>,

    /// Handler invocations that could not complete immediately.
    pending_handlers: RefCell<Vec<PendingHandler>>,
}

// Public API.
impl<D: Driver> HomaTransport<D> {
    /// Create a transport over `driver`. `client_id` must be unique among
    /// all transports in the cluster.
    pub fn new(driver: D, client_id: ClientId, config: Config) -> Self {
        Self::with_clock(driver, client_id, config, Clock::new())
    }

    pub(crate) fn with_clock(driver: D, client_id: ClientId, config: Config, clock: Clock) -> Self {
        assert!(
            config.small_message_threshold <= config.round_trip_bytes,
            "small_message_threshold must not exceed round_trip_bytes"
        );
        let prio = PriorityPlan::new(driver.highest_priority(), &config.unsched_prio_cutoffs);
        let grant_increment = if config.grant_increment == 0 {
            config.round_trip_bytes
        } else {
            config.grant_increment
        };
        let max_granted_messages = if config.max_granted_messages == 0 {
            prio.num_sched_prios()
        } else {
            config.max_granted_messages
        };
        let now = clock.now();

        Self {
            client_id,
            state: RefCell::new(Inner {
                max_data_per_packet: driver.max_packet_data() as u32,
                driver,
                client_id,
                round_trip_bytes: config.round_trip_bytes,
                grant_increment,
                message_zero_copy_threshold: config.message_zero_copy_threshold,
                small_message_threshold: config.small_message_threshold,
                max_granted_messages,
                timeout_intervals: config.timeout_intervals,
                ping_intervals: config.ping_intervals,
                timer_interval: config.timer_interval,
                prio,
                next_client_sequence: 1,
                next_server_sequence: 1,
                sessions: Vec::new(),
                outgoing_rpcs: HashMap::default(),
                outgoing_requests: Vec::new(),
                incoming_rpcs: HashMap::default(),
                outgoing_responses: Vec::new(),
                server_timer_list: Vec::new(),
                top_outgoing: Vec::new(),
                transmit_data_slow_path: false,
                active_messages: Vec::new(),
                inactive_messages: Vec::new(),
                messages_to_grant: Vec::new(),
                rx_scratch: Vec::with_capacity(MAX_RX_PACKETS),
                completions: Vec::new(),
                ready_requests: Vec::new(),
                hasher: RandomState::new(),
                next_timeout_check: now + config.timer_interval,
                timeout_check_deadline: None,
            }),
            clock,
            handler: RefCell::new(None),
            pending_handlers: RefCell::new(Vec::new()),
        }
    }

    /// Return this transport's client id.
    #[inline(always)]
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Locator string describing this transport.
    pub fn service_locator(&self) -> String {
        self.state.borrow().driver.service_locator()
    }

    /// Register application memory with the driver, for drivers capable of
    /// zero-copy access.
    pub fn register_memory(&self, base: *mut u8, bytes: usize) {
        self.state.borrow_mut().driver.register_memory(base, bytes);
    }

    /// Open a session to the server at `server_address`. The session lives
    /// for the lifetime of the transport and may outlive its RPCs.
    pub fn get_session(&self, server_address: D::Address) -> SessionHandle<'_, D> {
        self.make_session(server_address, None)
    }

    /// Like [`get_session`](Self::get_session), but RPCs on this session
    /// time out after `timeout` of peer silence instead of the
    /// transport-wide default.
    pub fn get_session_with_timeout(
        &self,
        server_address: D::Address,
        timeout: Duration,
    ) -> SessionHandle<'_, D> {
        let interval = self.state.borrow().timer_interval;
        let ticks = (timeout.as_nanos() / interval.as_nanos().max(1)) as u32;
        // Fewer than two ticks cannot distinguish silence from scheduling
        // jitter.
        self.make_session(server_address, Some(ticks.max(2)))
    }

    fn make_session(
        &self,
        server_address: D::Address,
        timeout_intervals: Option<u32>,
    ) -> SessionHandle<'_, D> {
        let mut state = self.state.borrow_mut();
        let sess_id = state.sessions.len();
        state.sessions.push(SessionState {
            server_address,
            aborted: false,
            timeout_intervals,
        });
        drop(state);
        SessionHandle::new(self, sess_id)
    }

    /// Register the server-side request handler.
    ///
    /// The handler runs on the dispatch thread when a request has been fully
    /// received; its resolved value becomes the response message. Handlers
    /// that are not immediately ready are re-polled on every poll.
    pub fn set_handler<H, F>(&self, handler: H)
    where
        H: Fn(Request) -> F + 'static,
        F: Future<Output = Vec<u8>> + 'static,
    {
        *self.handler.borrow_mut() = Some(Box::new(move |req| Box::pin(handler(req))));
    }

    /// Run one iteration of the event loop: poll parked request handlers,
    /// drain received packets, emit grants, transmit data, check timeouts
    /// and deliver completions. Returns a count of useful work done; zero
    /// means the poll was idle.
    pub fn poll(&self) -> usize {
        let mut work = self.poll_pending_handlers();

        {
            let mut state = self.state.borrow_mut();
            let now = self.clock.now();
            let received = state.process_rx(now);
            state.send_grants();
            let sent = state.try_to_transmit(now);
            state.maybe_check_timeouts(now, received == 0 && sent == 0);
            #[cfg(debug_assertions)]
            state.assert_scheduler_invariants();
            work += received + usize::from(sent > 0);
        }

        work + self.dispatch_events()
    }
}

// Session operations, invoked through `SessionHandle`.
impl<D: Driver> HomaTransport<D> {
    pub(crate) fn issue_request(
        &self,
        sess_id: usize,
        request: Vec<u8>,
        response: Vec<u8>,
        notifier: Box<dyn RpcNotifier>,
    ) -> Sequence {
        let sequence = {
            let mut state = self.state.borrow_mut();
            let now = self.clock.now();
            state.send_request(now, sess_id, request, response, notifier)
        };
        // Flush the immediate failure of requests on aborted sessions.
        self.dispatch_events();
        sequence
    }

    pub(crate) fn cancel_request(&self, sess_id: usize, sequence: Sequence) {
        self.state.borrow_mut().cancel_request(sess_id, sequence);
        self.dispatch_events();
    }

    pub(crate) fn abort_session(&self, sess_id: usize) {
        self.state.borrow_mut().abort_session(sess_id);
        self.dispatch_events();
    }

    pub(crate) fn rpc_info(&self, sess_id: usize) -> String {
        let state = self.state.borrow();
        let mut rpcs: Vec<(&Sequence, &ClientRpc<D>)> = state
            .outgoing_rpcs
            .iter()
            .filter(|(_, rpc)| rpc.session_id == sess_id)
            .collect();
        rpcs.sort_by_key(|(&sequence, _)| sequence);

        let mut out = String::new();
        for (_, rpc) in rpcs {
            let _ = writeln!(
                out,
                "RPC {}: {}/{} request bytes sent, {} response bytes received",
                rpc.rpc_id,
                rpc.request.transmit_offset,
                rpc.request.total_length(),
                rpc.accumulator.as_ref().map_or(0, |acc| acc.assembled()),
            );
        }
        if out.is_empty() {
            out.push_str("no outstanding RPCs");
        }
        out
    }
}

// Deferred user-code dispatch: notifiers and request handlers.
impl<D: Driver> HomaTransport<D> {
    /// Deliver deferred completions and hand completed requests to the
    /// handler. Runs with the interior borrow released, so notifiers and
    /// handlers may issue new RPCs.
    fn dispatch_events(&self) -> usize {
        let (completions, requests) = {
            let mut state = self.state.borrow_mut();
            (
                mem::take(&mut state.completions),
                mem::take(&mut state.ready_requests),
            )
        };
        let work = completions.len() + requests.len();

        for (mut notifier, outcome) in completions {
            match outcome {
                Ok(response) => notifier.completed(response),
                Err(error) => notifier.failed(error),
            }
        }

        for request in requests {
            let rpc_id = request.rpc_id();
            let fut = match &*self.handler.borrow() {
                Some(handler) => handler(request),
                None => {
                    log::warn!(
                        "transport {}: no request handler registered, dropping RPC {}",
                        self.client_id,
                        rpc_id
                    );
                    self.state.borrow_mut().delete_server_rpc(rpc_id);
                    continue;
                }
            };
            self.drive_handler(rpc_id, fut);
        }

        work
    }

    /// Poll a handler future once. Synchronous handlers resolve here;
    /// asynchronous ones are parked until a later poll.
    fn drive_handler(&self, rpc_id: RpcId, mut fut: ReqHandlerFuture) {
        let mut cx = std::task::Context::from_waker(noop_waker_ref());
        match fut.poll_unpin(&mut cx) {
            std::task::Poll::Ready(response) => {
                let now = self.clock.now();
                self.state.borrow_mut().send_reply(rpc_id, response, now);
            }
            std::task::Poll::Pending => self
                .pending_handlers
                .borrow_mut()
                .push(PendingHandler::new(rpc_id, fut)),
        }
    }

    fn poll_pending_handlers(&self) -> usize {
        if likely(self.pending_handlers.borrow().is_empty()) {
            return 0;
        }

        let pending = mem::take(&mut *self.pending_handlers.borrow_mut());
        let before = pending.len();
        for entry in pending {
            self.drive_handler(entry.rpc_id, entry.handler);
        }
        // Nested polls may have parked new handlers in the meantime.
        before.saturating_sub(self.pending_handlers.borrow().len())
    }
}

#[cfg(test)]
impl<D: Driver> HomaTransport<D> {
    pub(crate) fn active_message_count(&self) -> usize {
        self.state.borrow().active_messages.len()
    }

    pub(crate) fn inactive_message_count(&self) -> usize {
        self.state.borrow().inactive_messages.len()
    }

    pub(crate) fn outstanding_client_rpcs(&self) -> usize {
        self.state.borrow().outgoing_rpcs.len()
    }

    pub(crate) fn incoming_server_rpcs(&self) -> usize {
        self.state.borrow().incoming_rpcs.len()
    }
}

// Packet reception and dispatch.
impl<D: Driver> Inner<D> {
    fn process_rx(&mut self, now: Instant) -> usize {
        let mut packets = mem::take(&mut self.rx_scratch);
        self.driver.receive(MAX_RX_PACKETS, &mut packets);
        let count = packets.len();
        for (sender, packet) in packets.drain(..) {
            self.handle_packet(now, sender, packet);
        }
        self.rx_scratch = packets;
        count
    }

    /// Demultiplex one received packet.
    fn handle_packet(&mut self, now: Instant, sender: D::Address, packet: D::Packet) {
        let Some(common) = CommonHeader::from_bytes(packet.as_ref()) else {
            log::warn!(
                "transport {}: dropping runt packet ({} bytes) from {}",
                self.client_id,
                packet.as_ref().len(),
                sender
            );
            return;
        };
        let Some(opcode) = PacketOpcode::from_u8(common.opcode()) else {
            log::warn!(
                "transport {}: dropping packet with unknown opcode {} from {}",
                self.client_id,
                common.opcode(),
                sender
            );
            return;
        };

        let rpc_id = common.rpc_id();
        if common.flags() & FROM_CLIENT != 0 {
            self.handle_packet_from_client(now, sender, packet, opcode, rpc_id);
        } else {
            self.handle_packet_from_server(now, sender, packet, opcode, rpc_id);
        }
    }

    /// Handle a packet sent by a server; we are the client of this RPC.
    fn handle_packet_from_server(
        &mut self,
        now: Instant,
        sender: D::Address,
        packet: D::Packet,
        opcode: PacketOpcode,
        rpc_id: RpcId,
    ) {
        if unlikely(rpc_id.client_id != self.client_id) {
            log::warn!(
                "transport {}: dropping {} packet addressed to foreign client ({})",
                self.client_id,
                opcode_symbol(opcode as u8),
                rpc_id
            );
            return;
        }

        let sequence = rpc_id.sequence;
        match self.outgoing_rpcs.get_mut(&sequence) {
            // Any sign of life from the server resets the silence counter.
            Some(rpc) => rpc.silent_intervals = 0,
            None => {
                log::debug!(
                    "transport {}: dropping {} packet for unknown RPC {}",
                    self.client_id,
                    opcode_symbol(opcode as u8),
                    rpc_id
                );
                return;
            }
        }

        match opcode {
            PacketOpcode::AllData => match AllDataHeader::from_bytes(packet.as_ref()) {
                Some(hdr) => self.client_all_data(packet, hdr),
                None => self.log_malformed(opcode, &sender),
            },
            PacketOpcode::Data => match DataHeader::from_bytes(packet.as_ref()) {
                Some(hdr) => self.client_data(sender, packet, hdr),
                None => self.log_malformed(opcode, &sender),
            },
            PacketOpcode::Grant => match GrantHeader::from_bytes(packet.as_ref()) {
                Some(hdr) => self.client_grant(hdr),
                None => self.log_malformed(opcode, &sender),
            },
            PacketOpcode::Resend => match ResendHeader::from_bytes(packet.as_ref()) {
                Some(hdr) => self.client_resend(now, hdr),
                None => self.log_malformed(opcode, &sender),
            },
            PacketOpcode::Busy => {}
            PacketOpcode::LogTimeTrace => {
                log::info!(
                    "transport {}: time trace requested by server (RPC {})",
                    self.client_id,
                    rpc_id
                );
            }
            PacketOpcode::Abort => {
                log::warn!(
                    "transport {}: dropping ABORT carrying a server direction flag (RPC {})",
                    self.client_id,
                    rpc_id
                );
            }
        }
    }

    /// Handle a packet sent by a client; we are the server of this RPC.
    fn handle_packet_from_client(
        &mut self,
        now: Instant,
        sender: D::Address,
        packet: D::Packet,
        opcode: PacketOpcode,
        rpc_id: RpcId,
    ) {
        match opcode {
            PacketOpcode::AllData => match AllDataHeader::from_bytes(packet.as_ref()) {
                Some(hdr) => self.server_all_data(sender, packet, hdr),
                None => self.log_malformed(opcode, &sender),
            },
            PacketOpcode::Data => match DataHeader::from_bytes(packet.as_ref()) {
                Some(hdr) => self.server_data(sender, packet, hdr),
                None => self.log_malformed(opcode, &sender),
            },
            PacketOpcode::Grant => match GrantHeader::from_bytes(packet.as_ref()) {
                Some(hdr) => self.server_grant(hdr),
                None => self.log_malformed(opcode, &sender),
            },
            PacketOpcode::Resend => match ResendHeader::from_bytes(packet.as_ref()) {
                Some(hdr) => self.server_resend(now, &sender, hdr),
                None => self.log_malformed(opcode, &sender),
            },
            PacketOpcode::Busy => {
                if let Some(rpc) = self.incoming_rpcs.get_mut(&rpc_id) {
                    rpc.silent_intervals = 0;
                }
            }
            PacketOpcode::Abort => {
                if self.delete_server_rpc(rpc_id).is_some() {
                    log::debug!(
                        "transport {}: RPC {} cancelled by its client",
                        self.client_id,
                        rpc_id
                    );
                }
            }
            PacketOpcode::LogTimeTrace => {
                log::info!(
                    "transport {}: time trace requested by client (RPC {})",
                    self.client_id,
                    rpc_id
                );
            }
        }
    }

    #[cold]
    fn log_malformed(&self, opcode: PacketOpcode, sender: &D::Address) {
        log::warn!(
            "transport {}: dropping malformed {} packet from {}",
            self.client_id,
            opcode_symbol(opcode as u8),
            sender
        );
    }
}

// Client-side packet handling (we issued the RPC).
impl<D: Driver> Inner<D> {
    /// An entire response in one packet.
    fn client_all_data(&mut self, packet: D::Packet, hdr: AllDataHeader) {
        let sequence = hdr.rpc_id().sequence;
        let length = hdr.message_length() as usize;
        let body = &packet.as_ref()[AllDataHeader::WIRE_SIZE..];
        if unlikely(body.len() < length) {
            log::warn!(
                "transport {}: dropping truncated ALL_DATA for RPC {} ({} < {})",
                self.client_id,
                hdr.rpc_id(),
                body.len(),
                length
            );
            return;
        }
        if self.outgoing_rpcs[&sequence].accumulator.is_some() {
            // A multi-packet reassembly is underway; this must be a stray
            // duplicate.
            return;
        }

        let mut rpc = self
            .delete_client_rpc(sequence)
            .expect("caller checked existence");
        let mut response = rpc.response.take().unwrap_or_default();
        response.clear();
        response.extend_from_slice(&body[..length]);
        if let Some(notifier) = rpc.notifier.take() {
            self.completions.push((notifier, Ok(response)));
        }
    }

    /// A portion of a multi-packet response.
    fn client_data(&mut self, sender: D::Address, packet: D::Packet, hdr: DataHeader) {
        let sequence = hdr.rpc_id().sequence;
        let total = hdr.total_length();
        let offset = hdr.offset();
        if unlikely(total == 0 || offset >= total) {
            log::warn!(
                "transport {}: dropping bogus DATA for RPC {} (offset {}, total {})",
                self.client_id,
                hdr.rpc_id(),
                offset,
                total
            );
            return;
        }
        let payload_len = (packet.as_ref().len() - DataHeader::WIRE_SIZE) as u32;
        let length = payload_len.min(total - offset);
        if unlikely(length == 0) {
            return;
        }

        let sender_hash = self.hasher.hash_one(&sender);
        let zero_copy_limit = self.message_zero_copy_threshold;
        let rpc = self
            .outgoing_rpcs
            .get_mut(&sequence)
            .expect("caller checked existence");
        if rpc.accumulator.is_none() {
            let buffer = rpc.response.take().unwrap_or_default();
            rpc.accumulator = Some(MessageAccumulator::new(buffer, total, zero_copy_limit));
            if total > hdr.unscheduled_bytes() {
                rpc.scheduled = Some(ScheduledMessage::new(
                    rpc.rpc_id,
                    sender_hash,
                    total,
                    hdr.unscheduled_bytes(),
                    0,
                ));
            }
        }

        let (complete, scheduled) = {
            let acc = rpc.accumulator.as_mut().unwrap();
            if unlikely(acc.total_length() != total) {
                log::warn!(
                    "transport {}: dropping DATA with inconsistent total length for RPC {}",
                    self.client_id,
                    hdr.rpc_id()
                );
                return;
            }
            acc.add_packet(offset, packet, DataHeader::WIRE_SIZE, length);
            (acc.is_complete(), rpc.scheduled.is_some())
        };

        if complete {
            let mut rpc = self.delete_client_rpc(sequence).unwrap();
            let response = rpc.accumulator.take().unwrap().into_buffer();
            if let Some(notifier) = rpc.notifier.take() {
                self.completions.push((notifier, Ok(response)));
            }
        } else if scheduled {
            self.data_packet_arrive(SchedKey::Response(sequence));
        }
    }

    /// The server granted more of our request.
    fn client_grant(&mut self, hdr: GrantHeader) {
        let sequence = hdr.rpc_id().sequence;
        let rpc = self
            .outgoing_rpcs
            .get_mut(&sequence)
            .expect("caller checked existence");
        if rpc.request.handle_grant(hdr.offset(), hdr.priority()) {
            self.maintain_top_outgoing(OutKey::Request(sequence));
        }
    }

    /// The server wants part of our request again, or wants us to start
    /// over from scratch.
    fn client_resend(&mut self, now: Instant, hdr: ResendHeader) {
        let sequence = hdr.rpc_id().sequence;

        if hdr.flags() & RESTART != 0 {
            let rpc = self
                .outgoing_rpcs
                .get_mut(&sequence)
                .expect("caller checked existence");
            log::info!(
                "transport {}: server lost state for RPC {}, resending from scratch",
                self.client_id,
                rpc.rpc_id
            );
            // Discard any partial response along with its scheduler state;
            // dropping the accumulator releases its stolen packets.
            rpc.accumulator = None;
            let sched_state = rpc.scheduled.take().map(|m| m.state);
            rpc.request.restart();
            if !rpc.transmit_pending {
                rpc.transmit_pending = true;
                self.outgoing_requests.push(sequence);
            }
            if let Some(state) = sched_state {
                self.unlink_sched_key(SchedKey::Response(sequence), state);
            }
            self.maintain_top_outgoing(OutKey::Request(sequence));
            return;
        }

        let Inner {
            driver,
            outgoing_rpcs,
            prio,
            ..
        } = self;
        let rpc = outgoing_rpcs
            .get_mut(&sequence)
            .expect("caller checked existence");
        let offset = hdr.offset();
        if offset >= rpc.request.transmit_offset {
            // Those bytes were never transmitted, so nothing was lost; let
            // the server know we are still alive.
            let busy = CommonHeader::new(PacketOpcode::Busy, rpc.rpc_id, FROM_CLIENT);
            driver.send(
                &rpc.server_address,
                busy.as_bytes(),
                &[],
                prio.highest_avail,
            );
            return;
        }

        let max_bytes = hdr.length().min(rpc.request.transmit_offset - offset);
        send_message_bytes(
            driver,
            &rpc.server_address,
            rpc.rpc_id,
            &rpc.request,
            offset,
            max_bytes,
            hdr.priority(),
            FROM_CLIENT | RETRANSMISSION,
        );
        rpc.request.last_transmit_time = Some(now);
    }
}

// Server-side packet handling (the peer issued the RPC).
impl<D: Driver> Inner<D> {
    /// An entire request in one packet.
    fn server_all_data(&mut self, sender: D::Address, packet: D::Packet, hdr: AllDataHeader) {
        let rpc_id = hdr.rpc_id();
        let length = hdr.message_length() as usize;
        let body = &packet.as_ref()[AllDataHeader::WIRE_SIZE..];
        if unlikely(body.len() < length) {
            log::warn!(
                "transport {}: dropping truncated ALL_DATA for RPC {} ({} < {})",
                self.client_id,
                rpc_id,
                body.len(),
                length
            );
            return;
        }

        if let Some(rpc) = self.incoming_rpcs.get_mut(&rpc_id) {
            // Duplicate of a request we already have.
            rpc.silent_intervals = 0;
            return;
        }

        let sequence = self.next_server_sequence;
        self.next_server_sequence += 1;
        let mut rpc = ServerRpc::new(sequence, rpc_id, sender);
        // The whole request is here; it goes straight to execution, so the
        // timer does not monitor it.
        rpc.request_complete = true;
        self.incoming_rpcs.insert(rpc_id, rpc);
        self.ready_requests
            .push(Request::new(rpc_id, body[..length].to_vec()));
    }

    /// A portion of a multi-packet request.
    fn server_data(&mut self, sender: D::Address, packet: D::Packet, hdr: DataHeader) {
        let rpc_id = hdr.rpc_id();
        let total = hdr.total_length();
        let offset = hdr.offset();
        if unlikely(total == 0 || offset >= total) {
            log::warn!(
                "transport {}: dropping bogus DATA for RPC {} (offset {}, total {})",
                self.client_id,
                rpc_id,
                offset,
                total
            );
            return;
        }
        let payload_len = (packet.as_ref().len() - DataHeader::WIRE_SIZE) as u32;
        let length = payload_len.min(total - offset);
        if unlikely(length == 0) {
            return;
        }

        if !self.incoming_rpcs.contains_key(&rpc_id) {
            // First packet of a new request.
            let sequence = self.next_server_sequence;
            self.next_server_sequence += 1;
            let mut rpc = ServerRpc::new(sequence, rpc_id, sender.clone());
            rpc.in_timer_list = true;
            self.incoming_rpcs.insert(rpc_id, rpc);
            self.server_timer_list.push(rpc_id);
        }

        let sender_hash = self.hasher.hash_one(&sender);
        let zero_copy_limit = self.message_zero_copy_threshold;
        let rpc = self.incoming_rpcs.get_mut(&rpc_id).unwrap();
        rpc.silent_intervals = 0;
        if unlikely(rpc.request_complete) {
            // Duplicate tail of a request we already have.
            return;
        }
        if rpc.accumulator.is_none() {
            rpc.accumulator = Some(MessageAccumulator::new(Vec::new(), total, zero_copy_limit));
            if total > hdr.unscheduled_bytes() {
                rpc.scheduled = Some(ScheduledMessage::new(
                    rpc_id,
                    sender_hash,
                    total,
                    hdr.unscheduled_bytes(),
                    0,
                ));
            }
        }

        let (complete, scheduled) = {
            let acc = rpc.accumulator.as_mut().unwrap();
            if unlikely(acc.total_length() != total) {
                log::warn!(
                    "transport {}: dropping DATA with inconsistent total length for RPC {}",
                    self.client_id,
                    rpc_id
                );
                return;
            }
            acc.add_packet(offset, packet, DataHeader::WIRE_SIZE, length);
            (acc.is_complete(), rpc.scheduled.is_some())
        };

        if complete {
            let rpc = self.incoming_rpcs.get_mut(&rpc_id).unwrap();
            rpc.request_complete = true;
            let payload = rpc.accumulator.take().unwrap().into_buffer();
            let sched_state = rpc.scheduled.take().map(|m| m.state);
            // The request now goes to execution; stop monitoring it.
            if rpc.in_timer_list {
                rpc.in_timer_list = false;
                self.server_timer_list.retain(|&id| id != rpc_id);
            }
            if let Some(state) = sched_state {
                self.unlink_sched_key(SchedKey::Request(rpc_id), state);
            }
            self.ready_requests.push(Request::new(rpc_id, payload));
        } else if scheduled {
            self.data_packet_arrive(SchedKey::Request(rpc_id));
        }
    }

    /// The client granted more of our response.
    fn server_grant(&mut self, hdr: GrantHeader) {
        let rpc_id = hdr.rpc_id();
        let Some(rpc) = self.incoming_rpcs.get_mut(&rpc_id) else {
            log::debug!(
                "transport {}: dropping GRANT for unknown RPC {}",
                self.client_id,
                rpc_id
            );
            return;
        };
        rpc.silent_intervals = 0;

        let mut maintain = false;
        if rpc.sending_response {
            if let Some(msg) = rpc.response.as_mut() {
                maintain = msg.handle_grant(hdr.offset(), hdr.priority());
            }
        }
        if maintain {
            self.maintain_top_outgoing(OutKey::Response(rpc_id));
        }
    }

    /// The client wants part of our response again, or is probing an RPC we
    /// have no record of.
    fn server_resend(&mut self, now: Instant, sender: &D::Address, hdr: ResendHeader) {
        let rpc_id = hdr.rpc_id();
        if !self.incoming_rpcs.contains_key(&rpc_id) {
            // No record of this RPC (never received, or already finished and
            // dismissed). Make the client start over from scratch.
            log::info!(
                "transport {}: no state for RPC {}, telling client to restart",
                self.client_id,
                rpc_id
            );
            let resend = ResendHeader::new(
                rpc_id,
                0,
                self.round_trip_bytes,
                self.prio.highest_avail,
                FROM_SERVER | RESTART,
            );
            self.send_control(sender, resend.as_bytes());
            return;
        }

        // A RESEND is a probe, not progress: it must not reset the silence
        // counter, or a regularly-pinging client would keep the request gap
        // timer from ever firing.
        let rpc = self.incoming_rpcs.get_mut(&rpc_id).unwrap();

        if !rpc.sending_response {
            // Still receiving or executing the request; reassure the client.
            let busy = CommonHeader::new(PacketOpcode::Busy, rpc_id, FROM_SERVER);
            let peer = rpc.client_address.clone();
            self.send_control(&peer, busy.as_bytes());
            return;
        }

        if hdr.flags() & RESTART != 0 {
            // The client lost all response state; resend from the start.
            log::info!(
                "transport {}: client lost response state for RPC {}, restarting",
                self.client_id,
                rpc_id
            );
            rpc.response.as_mut().unwrap().restart();
            self.maintain_top_outgoing(OutKey::Response(rpc_id));
            return;
        }

        let Inner {
            driver,
            incoming_rpcs,
            prio,
            ..
        } = self;
        let rpc = incoming_rpcs.get_mut(&rpc_id).unwrap();
        let msg = rpc.response.as_mut().unwrap();
        let offset = hdr.offset();
        if offset >= msg.transmit_offset {
            // Those bytes were never transmitted; nothing was lost.
            let busy = CommonHeader::new(PacketOpcode::Busy, rpc_id, FROM_SERVER);
            driver.send(
                &rpc.client_address,
                busy.as_bytes(),
                &[],
                prio.highest_avail,
            );
            return;
        }

        let max_bytes = hdr.length().min(msg.transmit_offset - offset);
        send_message_bytes(
            driver,
            &rpc.client_address,
            rpc_id,
            msg,
            offset,
            max_bytes,
            hdr.priority(),
            FROM_SERVER | RETRANSMISSION,
        );
        msg.last_transmit_time = Some(now);
    }
}

// RPC issue, reply and teardown.
impl<D: Driver> Inner<D> {
    fn send_request(
        &mut self,
        now: Instant,
        sess_id: usize,
        request: Vec<u8>,
        response: Vec<u8>,
        notifier: Box<dyn RpcNotifier>,
    ) -> Sequence {
        let sequence = self.next_client_sequence;
        self.next_client_sequence += 1;

        let session = &self.sessions[sess_id];
        if unlikely(session.aborted) {
            self.completions
                .push((notifier, Err(RpcError::SessionAborted)));
            return sequence;
        }

        let server_address = session.server_address.clone();
        let rpc_id = RpcId::new(self.client_id, sequence);
        let total = request.len() as u32;
        let priority = if total <= self.round_trip_bytes {
            self.prio.unsched_priority(total)
        } else {
            self.prio.lowest_unsched
        };
        let mut rpc = ClientRpc {
            session_id: sess_id,
            rpc_id,
            server_address,
            request: OutgoingMessage::new(request, self.round_trip_bytes, priority),
            response: Some(response),
            notifier: Some(notifier),
            accumulator: None,
            scheduled: None,
            silent_intervals: 0,
            transmit_pending: true,
        };

        if total <= self.small_message_threshold {
            // Short-message shortcut: transmit inline at send time instead
            // of going through the SRPT machinery.
            let sent = send_message_bytes(
                &mut self.driver,
                &rpc.server_address,
                rpc_id,
                &rpc.request,
                0,
                rpc.request.transmit_limit,
                priority,
                FROM_CLIENT,
            );
            rpc.request.transmit_offset = sent;
            rpc.request.last_transmit_time = Some(now);
            rpc.transmit_pending = !rpc.request.fully_transmitted();
        }

        let pending = rpc.transmit_pending;
        self.outgoing_rpcs.insert(sequence, rpc);
        if pending {
            self.outgoing_requests.push(sequence);
            self.maintain_top_outgoing(OutKey::Request(sequence));
        }
        sequence
    }

    /// Start sending the response produced by the request handler.
    fn send_reply(&mut self, rpc_id: RpcId, payload: Vec<u8>, now: Instant) {
        let Some(rpc) = self.incoming_rpcs.get_mut(&rpc_id) else {
            // The RPC was aborted or timed out while the handler ran.
            log::debug!(
                "transport {}: discarding response for vanished RPC {}",
                self.client_id,
                rpc_id
            );
            return;
        };
        debug_assert!(rpc.request_complete && !rpc.sending_response);

        let total = payload.len() as u32;
        let priority = if total <= self.round_trip_bytes {
            self.prio.unsched_priority(total)
        } else {
            self.prio.lowest_unsched
        };
        rpc.response = Some(OutgoingMessage::new(
            payload,
            self.round_trip_bytes,
            priority,
        ));
        rpc.sending_response = true;
        if !rpc.in_timer_list {
            rpc.in_timer_list = true;
            self.server_timer_list.push(rpc_id);
        }

        if total <= self.small_message_threshold {
            let Inner {
                driver,
                incoming_rpcs,
                ..
            } = self;
            let rpc = incoming_rpcs.get_mut(&rpc_id).unwrap();
            let msg = rpc.response.as_mut().unwrap();
            let sent = send_message_bytes(
                driver,
                &rpc.client_address,
                rpc_id,
                msg,
                0,
                msg.transmit_limit,
                priority,
                FROM_SERVER,
            );
            msg.transmit_offset = sent;
            msg.last_transmit_time = Some(now);
            if msg.fully_transmitted() {
                // The entire response is with the driver; the RPC is done.
                self.delete_server_rpc(rpc_id);
                return;
            }
        }

        self.outgoing_responses.push(rpc_id);
        self.maintain_top_outgoing(OutKey::Response(rpc_id));
    }

    fn cancel_request(&mut self, sess_id: usize, sequence: Sequence) {
        match self.outgoing_rpcs.get(&sequence) {
            Some(rpc) if rpc.session_id == sess_id => {}
            _ => return,
        }
        let mut rpc = self.delete_client_rpc(sequence).unwrap();
        let abort = CommonHeader::new(PacketOpcode::Abort, rpc.rpc_id, FROM_CLIENT);
        let peer = rpc.server_address.clone();
        self.send_control(&peer, abort.as_bytes());
        if let Some(notifier) = rpc.notifier.take() {
            self.completions.push((notifier, Err(RpcError::Cancelled)));
        }
    }

    fn abort_session(&mut self, sess_id: usize) {
        self.sessions[sess_id].aborted = true;
        let sequences: Vec<Sequence> = self
            .outgoing_rpcs
            .iter()
            .filter(|(_, rpc)| rpc.session_id == sess_id)
            .map(|(&sequence, _)| sequence)
            .collect();
        for sequence in sequences {
            let mut rpc = self.delete_client_rpc(sequence).unwrap();
            let abort = CommonHeader::new(PacketOpcode::Abort, rpc.rpc_id, FROM_CLIENT);
            let peer = rpc.server_address.clone();
            self.send_control(&peer, abort.as_bytes());
            if let Some(notifier) = rpc.notifier.take() {
                self.completions
                    .push((notifier, Err(RpcError::SessionAborted)));
            }
        }
    }

    /// Unlink a client RPC from every transport structure and return it.
    fn delete_client_rpc(&mut self, sequence: Sequence) -> Option<ClientRpc<D>> {
        let rpc = self.outgoing_rpcs.remove(&sequence)?;
        if rpc.transmit_pending {
            self.outgoing_requests.retain(|&s| s != sequence);
        }
        if rpc.request.top_choice {
            self.remove_top(OutKey::Request(sequence));
        }
        if let Some(m) = &rpc.scheduled {
            self.unlink_sched_key(SchedKey::Response(sequence), m.state);
        }
        Some(rpc)
    }

    /// Unlink a server RPC from every transport structure and return it.
    fn delete_server_rpc(&mut self, rpc_id: RpcId) -> Option<ServerRpc<D>> {
        let rpc = self.incoming_rpcs.remove(&rpc_id)?;
        if rpc.in_timer_list {
            self.server_timer_list.retain(|&id| id != rpc_id);
        }
        if rpc.sending_response {
            self.outgoing_responses.retain(|&id| id != rpc_id);
        }
        if rpc.response.as_ref().map_or(false, |m| m.top_choice) {
            self.remove_top(OutKey::Response(rpc_id));
        }
        if let Some(m) = &rpc.scheduled {
            self.unlink_sched_key(SchedKey::Request(rpc_id), m.state);
        }
        Some(rpc)
    }
}

// Transmit engine: SRPT selection with a bounded fast path.
impl<D: Driver> Inner<D> {
    fn try_to_transmit(&mut self, now: Instant) -> usize {
        let mut total_sent = 0;
        loop {
            if self.driver.tx_queue_space() == 0 {
                break;
            }

            let mut key = self.best_ready_top();
            if key.is_none() && self.transmit_data_slow_path {
                self.rebuild_top_outgoing();
                key = self.best_ready_top();
            }
            let Some(key) = key else { break };

            let sent = self.transmit_one(key, now);
            if sent == 0 {
                break;
            }
            total_sent += sent;
        }
        total_sent
    }

    /// Among the top outgoing messages, the ready one with the fewest bytes
    /// remaining.
    fn best_ready_top(&self) -> Option<OutKey> {
        let mut best: Option<(u32, OutKey)> = None;
        for &key in &self.top_outgoing {
            let Some(msg) = self.outgoing_msg(key) else {
                continue;
            };
            if !msg.ready() {
                continue;
            }
            let remaining = msg.bytes_remaining();
            if best.map_or(true, |(b, _)| remaining < b) {
                best = Some((remaining, key));
            }
        }
        best.map(|(_, key)| key)
    }

    /// Emit one packet of the chosen message and advance its transmit
    /// pointer, retiring the message if it is now fully transmitted.
    fn transmit_one(&mut self, key: OutKey, now: Instant) -> usize {
        let mut sent = 0;
        let mut finished_request = None;
        let mut finished_response = None;

        match key {
            OutKey::Request(sequence) => {
                let Inner {
                    driver,
                    outgoing_rpcs,
                    max_data_per_packet,
                    ..
                } = self;
                if let Some(rpc) = outgoing_rpcs.get_mut(&sequence) {
                    let offset = rpc.request.transmit_offset;
                    let budget = (*max_data_per_packet).min(rpc.request.transmit_limit - offset);
                    sent = send_message_bytes(
                        driver,
                        &rpc.server_address,
                        rpc.rpc_id,
                        &rpc.request,
                        offset,
                        budget,
                        rpc.request.transmit_priority,
                        FROM_CLIENT,
                    );
                    rpc.request.transmit_offset += sent;
                    rpc.request.last_transmit_time = Some(now);
                    if rpc.request.fully_transmitted() {
                        finished_request = Some(sequence);
                    }
                }
            }
            OutKey::Response(rpc_id) => {
                let Inner {
                    driver,
                    incoming_rpcs,
                    max_data_per_packet,
                    ..
                } = self;
                if let Some(rpc) = incoming_rpcs.get_mut(&rpc_id) {
                    if let Some(msg) = rpc.response.as_mut() {
                        let offset = msg.transmit_offset;
                        let budget = (*max_data_per_packet).min(msg.transmit_limit - offset);
                        sent = send_message_bytes(
                            driver,
                            &rpc.client_address,
                            rpc_id,
                            msg,
                            offset,
                            budget,
                            msg.transmit_priority,
                            FROM_SERVER,
                        );
                        msg.transmit_offset += sent;
                        msg.last_transmit_time = Some(now);
                        if msg.fully_transmitted() {
                            finished_response = Some(rpc_id);
                        }
                    }
                }
            }
        }

        if let Some(sequence) = finished_request {
            // The request has now been fully transmitted for the first time;
            // the RPC stays alive awaiting its response.
            if let Some(rpc) = self.outgoing_rpcs.get_mut(&sequence) {
                rpc.transmit_pending = false;
            }
            self.outgoing_requests.retain(|&s| s != sequence);
            self.remove_top(OutKey::Request(sequence));
        }
        if let Some(rpc_id) = finished_response {
            // The last response byte is with the driver; the RPC is done.
            self.delete_server_rpc(rpc_id);
        }
        sent as usize
    }

    fn outgoing_msg(&self, key: OutKey) -> Option<&OutgoingMessage> {
        match key {
            OutKey::Request(sequence) => self.outgoing_rpcs.get(&sequence).map(|r| &r.request),
            OutKey::Response(rpc_id) => self
                .incoming_rpcs
                .get(&rpc_id)
                .and_then(|r| r.response.as_ref()),
        }
    }

    fn outgoing_msg_mut(&mut self, key: OutKey) -> Option<&mut OutgoingMessage> {
        match key {
            OutKey::Request(sequence) => {
                self.outgoing_rpcs.get_mut(&sequence).map(|r| &mut r.request)
            }
            OutKey::Response(rpc_id) => self
                .incoming_rpcs
                .get_mut(&rpc_id)
                .and_then(|r| r.response.as_mut()),
        }
    }

    /// Offer `key` a place among the top outgoing messages.
    fn maintain_top_outgoing(&mut self, key: OutKey) {
        let Some(msg) = self.outgoing_msg(key) else {
            return;
        };
        if msg.top_choice {
            return;
        }
        let remaining = msg.bytes_remaining();

        if self.top_outgoing.len() < TOP_OUTGOING_LIMIT {
            self.top_outgoing.push(key);
            self.outgoing_msg_mut(key).unwrap().top_choice = true;
            return;
        }

        // Full: displace the worst entry if the candidate beats it.
        let mut worst: Option<(usize, u32)> = None;
        for (i, &k) in self.top_outgoing.iter().enumerate() {
            let r = self
                .outgoing_msg(k)
                .map_or(0, |m| m.bytes_remaining());
            if worst.map_or(true, |(_, wr)| r > wr) {
                worst = Some((i, r));
            }
        }
        let (worst_idx, worst_remaining) = worst.unwrap();
        if remaining < worst_remaining {
            let evicted = self.top_outgoing.swap_remove(worst_idx);
            if let Some(m) = self.outgoing_msg_mut(evicted) {
                m.top_choice = false;
            }
            self.top_outgoing.push(key);
            self.outgoing_msg_mut(key).unwrap().top_choice = true;
        }
        // Either way some message now sits outside the top set.
        self.transmit_data_slow_path = true;
    }

    /// Drop `key` from the top set and force a refill scan.
    fn remove_top(&mut self, key: OutKey) {
        if let Some(pos) = self.top_outgoing.iter().position(|&k| k == key) {
            self.top_outgoing.swap_remove(pos);
            if let Some(msg) = self.outgoing_msg_mut(key) {
                msg.top_choice = false;
            }
            self.transmit_data_slow_path = true;
        }
    }

    /// Full scan over all outgoing messages, repopulating the top set with
    /// the ones that have the fewest bytes remaining.
    fn rebuild_top_outgoing(&mut self) {
        let old = mem::take(&mut self.top_outgoing);
        for key in old {
            if let Some(msg) = self.outgoing_msg_mut(key) {
                msg.top_choice = false;
            }
        }

        let mut candidates: Vec<(u32, OutKey)> = Vec::new();
        for &sequence in &self.outgoing_requests {
            if let Some(rpc) = self.outgoing_rpcs.get(&sequence) {
                candidates.push((rpc.request.bytes_remaining(), OutKey::Request(sequence)));
            }
        }
        for &rpc_id in &self.outgoing_responses {
            if let Some(msg) = self
                .incoming_rpcs
                .get(&rpc_id)
                .and_then(|r| r.response.as_ref())
            {
                candidates.push((msg.bytes_remaining(), OutKey::Response(rpc_id)));
            }
        }
        candidates.sort_unstable();
        candidates.truncate(TOP_OUTGOING_LIMIT);

        for (_, key) in candidates {
            self.outgoing_msg_mut(key).unwrap().top_choice = true;
            self.top_outgoing.push(key);
        }
        self.transmit_data_slow_path = false;
    }
}

// Receiver-side grant scheduler.
impl<D: Driver> Inner<D> {
    fn sched(&self, key: SchedKey) -> Option<&ScheduledMessage> {
        match key {
            SchedKey::Request(rpc_id) => self
                .incoming_rpcs
                .get(&rpc_id)
                .and_then(|r| r.scheduled.as_ref()),
            SchedKey::Response(sequence) => self
                .outgoing_rpcs
                .get(&sequence)
                .and_then(|r| r.scheduled.as_ref()),
        }
    }

    fn sched_mut(&mut self, key: SchedKey) -> Option<&mut ScheduledMessage> {
        match key {
            SchedKey::Request(rpc_id) => self
                .incoming_rpcs
                .get_mut(&rpc_id)
                .and_then(|r| r.scheduled.as_mut()),
            SchedKey::Response(sequence) => self
                .outgoing_rpcs
                .get_mut(&sequence)
                .and_then(|r| r.scheduled.as_mut()),
        }
    }

    /// The peer that is sending us the message behind `key`.
    fn sched_peer(&self, key: SchedKey) -> Option<D::Address> {
        match key {
            SchedKey::Request(rpc_id) => self
                .incoming_rpcs
                .get(&rpc_id)
                .map(|r| r.client_address.clone()),
            SchedKey::Response(sequence) => self
                .outgoing_rpcs
                .get(&sequence)
                .map(|r| r.server_address.clone()),
        }
    }

    /// A data packet arrived for a scheduled message: refresh its standing
    /// and consider granting more.
    fn data_packet_arrive(&mut self, key: SchedKey) {
        // Refresh the scheduler's mirror of bytes remaining.
        match key {
            SchedKey::Request(rpc_id) => {
                if let Some(rpc) = self.incoming_rpcs.get_mut(&rpc_id) {
                    if let (Some(acc), Some(m)) = (rpc.accumulator.as_ref(), rpc.scheduled.as_mut())
                    {
                        m.bytes_remaining = m.total_length - acc.assembled();
                    }
                }
            }
            SchedKey::Response(sequence) => {
                if let Some(rpc) = self.outgoing_rpcs.get_mut(&sequence) {
                    if let (Some(acc), Some(m)) = (rpc.accumulator.as_ref(), rpc.scheduled.as_mut())
                    {
                        m.bytes_remaining = m.total_length - acc.assembled();
                    }
                }
            }
        }

        match self.sched(key).map(|m| m.state) {
            Some(SchedState::New) => self.try_to_schedule(key),
            // Fewer bytes remaining can only improve its position.
            Some(SchedState::Active) => self.adjust_scheduling_precedence(key),
            _ => {}
        }
        self.maybe_queue_grant(key);
    }

    /// Place a newly-created scheduled message on the active or inactive
    /// list.
    fn try_to_schedule(&mut self, key: SchedKey) {
        let Some(sender_hash) = self.sched(key).map(|m| m.sender_hash) else {
            return;
        };
        debug_assert_eq!(self.sched(key).unwrap().state, SchedState::New);

        // A sender gets at most one active message; keep the better one of
        // the two active.
        let sibling = self
            .active_messages
            .iter()
            .copied()
            .find(|&k| self.sched(k).map_or(false, |m| m.sender_hash == sender_hash));
        if let Some(sibling) = sibling {
            let new_wins = {
                let m = self.sched(key).unwrap();
                let s = self.sched(sibling).unwrap();
                m.precedes(s)
            };
            if new_wins {
                self.demote_to_inactive(sibling);
                self.insert_active(key);
            } else {
                self.sched_mut(key).unwrap().state = SchedState::Inactive;
                self.inactive_messages.push(key);
            }
            return;
        }

        if (self.active_messages.len() as u32) < self.max_granted_messages {
            self.insert_active(key);
            return;
        }

        // All grant slots taken: preempt the worst active message if the
        // newcomer beats it.
        let tail = *self
            .active_messages
            .last()
            .expect("overcommitment degree is at least one");
        let new_wins = {
            let m = self.sched(key).unwrap();
            let t = self.sched(tail).unwrap();
            m.precedes(t)
        };
        if new_wins {
            self.demote_to_inactive(tail);
            self.insert_active(key);
        } else {
            self.sched_mut(key).unwrap().state = SchedState::Inactive;
            self.inactive_messages.push(key);
        }
    }

    /// Insert `key` into the active list at its SRPT position.
    fn insert_active(&mut self, key: SchedKey) {
        let pos = self.active_insert_pos(key);
        self.active_messages.insert(pos, key);
        self.sched_mut(key).unwrap().state = SchedState::Active;
        self.maybe_queue_grant(key);
    }

    fn active_insert_pos(&self, key: SchedKey) -> usize {
        let Some(msg) = self.sched(key) else {
            return self.active_messages.len();
        };
        self.active_messages
            .iter()
            .position(|&k| self.sched(k).map_or(false, |other| msg.precedes(other)))
            .unwrap_or(self.active_messages.len())
    }

    /// Move an active message to the inactive list.
    fn demote_to_inactive(&mut self, key: SchedKey) {
        self.remove_active(key);
        if let Some(m) = self.sched_mut(key) {
            m.state = SchedState::Inactive;
        }
        self.inactive_messages.push(key);
    }

    fn remove_active(&mut self, key: SchedKey) {
        if let Some(pos) = self.active_messages.iter().position(|&k| k == key) {
            self.active_messages.remove(pos);
        }
    }

    /// Restore the SRPT order of the active list after `key`'s remaining
    /// byte count decreased.
    fn adjust_scheduling_precedence(&mut self, key: SchedKey) {
        if let Some(pos) = self.active_messages.iter().position(|&k| k == key) {
            self.active_messages.remove(pos);
            let new_pos = self.active_insert_pos(key);
            self.active_messages.insert(new_pos, key);
        }
    }

    /// Queue a GRANT for `key` if it is active and its granted-but-unreceived
    /// window has dropped below one round-trip.
    fn maybe_queue_grant(&mut self, key: SchedKey) {
        let wants_grant = match self.sched(key) {
            Some(m) if m.state == SchedState::Active && !m.fully_granted() => {
                let assembled = m.total_length - m.bytes_remaining;
                m.grant_offset.saturating_sub(assembled) < self.round_trip_bytes
            }
            _ => false,
        };
        if wants_grant && !self.messages_to_grant.contains(&key) {
            self.messages_to_grant.push(key);
        }
    }

    /// Emit the GRANTs queued while processing this poll's packets.
    ///
    /// Grant priorities follow the receiver's ranking of active messages:
    /// the best active message gets the highest scheduled priority, the next
    /// one below, with a floor of zero.
    fn send_grants(&mut self) {
        while !self.messages_to_grant.is_empty() {
            let key = self.messages_to_grant.remove(0);
            let Some((rpc_id, grant_offset, total_length)) = self
                .sched(key)
                .filter(|m| m.state == SchedState::Active)
                .map(|m| (m.rpc_id, m.grant_offset, m.total_length))
            else {
                continue;
            };
            let Some(peer) = self.sched_peer(key) else {
                continue;
            };

            let rank = self
                .active_messages
                .iter()
                .position(|&k| k == key)
                .unwrap_or(0);
            let priority = self.prio.highest_sched.saturating_sub(rank as u8);
            let new_offset = total_length.min(grant_offset + self.grant_increment);
            if new_offset <= grant_offset {
                continue;
            }

            let hdr = GrantHeader::new(rpc_id, new_offset, priority, sched_dir_flags(key));
            self.send_control(&peer, hdr.as_bytes());
            log::trace!(
                "transport {}: granted RPC {} up to {} at priority {}",
                self.client_id,
                rpc_id,
                new_offset,
                priority
            );

            let m = self.sched_mut(key).unwrap();
            m.grant_offset = new_offset;
            m.grant_priority = priority;
            if new_offset == total_length {
                // Nothing further to grant; the message finishes on its own.
                m.state = SchedState::FullyGranted;
                self.remove_active(key);
                self.promote_best_inactive();
            }
        }
    }

    /// Fill free grant slots with the best inactive messages whose senders
    /// are not already being granted.
    fn promote_best_inactive(&mut self) {
        while (self.active_messages.len() as u32) < self.max_granted_messages {
            let mut best: Option<(usize, SchedKey)> = None;
            for (i, &k) in self.inactive_messages.iter().enumerate() {
                let Some(m) = self.sched(k) else { continue };
                let sender_active = self
                    .active_messages
                    .iter()
                    .any(|&a| self.sched(a).map_or(false, |am| am.sender_hash == m.sender_hash));
                if sender_active {
                    continue;
                }
                let better = match best {
                    Some((_, b)) => m.precedes(self.sched(b).unwrap()),
                    None => true,
                };
                if better {
                    best = Some((i, k));
                }
            }
            match best {
                Some((i, key)) => {
                    self.inactive_messages.swap_remove(i);
                    self.insert_active(key);
                }
                None => break,
            }
        }
    }

    /// Unlink a scheduled message (known to be in `state`) from the
    /// scheduler when its RPC goes away or its message completes.
    fn unlink_sched_key(&mut self, key: SchedKey, state: SchedState) {
        match state {
            SchedState::Active => {
                self.remove_active(key);
                self.promote_best_inactive();
            }
            SchedState::Inactive => {
                self.inactive_messages.retain(|&k| k != key);
            }
            SchedState::New | SchedState::FullyGranted => {}
        }
        self.messages_to_grant.retain(|&k| k != key);
    }

    #[cfg(debug_assertions)]
    fn assert_scheduler_invariants(&self) {
        assert!(self.active_messages.len() as u32 <= self.max_granted_messages);
        for window in self.active_messages.windows(2) {
            let a = self.sched(window[0]).unwrap();
            let b = self.sched(window[1]).unwrap();
            assert!(!b.precedes(a), "active list out of SRPT order");
        }
        let mut hashes: Vec<u64> = self
            .active_messages
            .iter()
            .filter_map(|&k| self.sched(k).map(|m| m.sender_hash))
            .collect();
        hashes.sort_unstable();
        hashes.dedup();
        assert_eq!(
            hashes.len(),
            self.active_messages.len(),
            "active senders not distinct"
        );
    }
}

// Timer and loss recovery.
impl<D: Driver> Inner<D> {
    /// Run the timeout check when due: immediately at a convenient (idle)
    /// moment after `next_timeout_check`, or forcibly once the deadline
    /// passes.
    fn maybe_check_timeouts(&mut self, now: Instant, idle: bool) {
        if now < self.next_timeout_check {
            return;
        }
        let deadline = *self
            .timeout_check_deadline
            .get_or_insert(now + self.timer_interval);
        if idle || now >= deadline {
            self.check_timeouts();
            self.next_timeout_check = now + self.timer_interval;
            self.timeout_check_deadline = None;
        }
    }

    fn check_timeouts(&mut self) {
        // Client side: probe silent servers, abandon dead ones.
        let sequences: Vec<Sequence> = self.outgoing_rpcs.keys().copied().collect();
        for sequence in sequences {
            let action = {
                let Some(rpc) = self.outgoing_rpcs.get_mut(&sequence) else {
                    continue;
                };
                rpc.silent_intervals += 1;
                if rpc.request.last_transmit_time.is_none() {
                    // Nothing sent yet; the transmit engine will get to it.
                    continue;
                }
                let timeout_intervals = self.sessions[rpc.session_id]
                    .timeout_intervals
                    .unwrap_or(self.timeout_intervals);
                if rpc.silent_intervals >= timeout_intervals {
                    Some(TimerAction::Abandon)
                } else if rpc.silent_intervals >= self.ping_intervals && !rpc.transmit_pending {
                    match rpc.accumulator.as_ref() {
                        Some(acc) => {
                            // Part of the response is here; chase the gap.
                            let grant_limit = rpc
                                .scheduled
                                .as_ref()
                                .map_or(acc.total_length(), |m| m.grant_offset);
                            acc.resend_gap(grant_limit, self.round_trip_bytes).map(
                                |(offset, length)| {
                                    let priority = rpc.scheduled.as_ref().map_or(
                                        self.prio.unsched_priority(acc.total_length()),
                                        |m| m.grant_priority,
                                    );
                                    TimerAction::Resend {
                                        peer: rpc.server_address.clone(),
                                        rpc_id: rpc.rpc_id,
                                        offset,
                                        length,
                                        priority,
                                        flags: FROM_CLIENT,
                                    }
                                },
                            )
                        }
                        // Not one response byte yet: ask for the whole
                        // prefix, flagging that we hold no response state.
                        None => Some(TimerAction::Resend {
                            peer: rpc.server_address.clone(),
                            rpc_id: rpc.rpc_id,
                            offset: 0,
                            length: self.round_trip_bytes,
                            priority: self.prio.highest_avail,
                            flags: FROM_CLIENT | RESTART,
                        }),
                    }
                } else {
                    None
                }
            };

            match action {
                Some(TimerAction::Abandon) => {
                    log::warn!(
                        "transport {}: RPC {} timed out waiting for the server",
                        self.client_id,
                        RpcId::new(self.client_id, sequence)
                    );
                    if let Some(mut rpc) = self.delete_client_rpc(sequence) {
                        if let Some(notifier) = rpc.notifier.take() {
                            self.completions.push((notifier, Err(RpcError::Timeout)));
                        }
                    }
                }
                Some(TimerAction::Resend {
                    peer,
                    rpc_id,
                    offset,
                    length,
                    priority,
                    flags,
                }) => {
                    let hdr = ResendHeader::new(rpc_id, offset, length, priority, flags);
                    self.send_control(&peer, hdr.as_bytes());
                }
                None => {}
            }
        }

        // Server side: chase request gaps, silently drop dead clients.
        let monitored: Vec<RpcId> = self.server_timer_list.clone();
        for rpc_id in monitored {
            let action = {
                let Some(rpc) = self.incoming_rpcs.get_mut(&rpc_id) else {
                    continue;
                };
                rpc.silent_intervals += 1;
                if rpc.silent_intervals >= self.timeout_intervals {
                    Some(TimerAction::Abandon)
                } else if rpc.silent_intervals >= self.ping_intervals && !rpc.request_complete {
                    rpc.accumulator.as_ref().and_then(|acc| {
                        let grant_limit = rpc
                            .scheduled
                            .as_ref()
                            .map_or(acc.total_length(), |m| m.grant_offset);
                        acc.resend_gap(grant_limit, self.round_trip_bytes).map(
                            |(offset, length)| {
                                let priority = rpc.scheduled.as_ref().map_or(
                                    self.prio.unsched_priority(acc.total_length()),
                                    |m| m.grant_priority,
                                );
                                TimerAction::Resend {
                                    peer: rpc.client_address.clone(),
                                    rpc_id,
                                    offset,
                                    length,
                                    priority,
                                    flags: FROM_SERVER,
                                }
                            },
                        )
                    })
                } else {
                    None
                }
            };

            match action {
                Some(TimerAction::Abandon) => {
                    // The client will notice on its own; nothing to send.
                    log::warn!(
                        "transport {}: abandoning RPC {} after {} silent intervals",
                        self.client_id,
                        rpc_id,
                        self.timeout_intervals
                    );
                    self.delete_server_rpc(rpc_id);
                }
                Some(TimerAction::Resend {
                    peer,
                    rpc_id,
                    offset,
                    length,
                    priority,
                    flags,
                }) => {
                    let hdr = ResendHeader::new(rpc_id, offset, length, priority, flags);
                    self.send_control(&peer, hdr.as_bytes());
                }
                None => {}
            }
        }
    }

    /// Control packets (GRANT, RESEND, BUSY, ABORT) go out at the highest
    /// available priority.
    fn send_control(&mut self, dst: &D::Address, header: &[u8]) {
        let priority = self.prio.highest_avail;
        self.driver.send(dst, header, &[], priority);
    }
}

/// Transmit message bytes `[offset, offset + max_bytes)`, clamped to the
/// message length, as one or more packets. A message that fits entirely in
/// one packet and is being sent whole goes out as ALL_DATA; everything else
/// goes out as DATA packets carrying the message's total length and
/// unscheduled allowance. Returns the number of payload bytes handed to the
/// driver.
fn send_message_bytes<D: Driver>(
    driver: &mut D,
    dst: &D::Address,
    rpc_id: RpcId,
    msg: &OutgoingMessage,
    offset: u32,
    max_bytes: u32,
    priority: u8,
    flags: u8,
) -> u32 {
    let total = msg.total_length();
    let max_data = driver.max_packet_data() as u32;
    let end = total.min(offset.saturating_add(max_bytes));

    if offset == 0 && end == total && total <= max_data {
        let hdr = AllDataHeader::new(rpc_id, flags, total as u16);
        driver.send(dst, hdr.as_bytes(), &msg.buffer, priority);
        return total;
    }

    let mut cursor = offset;
    while cursor < end {
        let chunk = max_data.min(end - cursor);
        let hdr = DataHeader::new(rpc_id, total, cursor, msg.unscheduled_bytes, flags);
        driver.send(
            dst,
            hdr.as_bytes(),
            &msg.buffer[cursor as usize..(cursor + chunk) as usize],
            priority,
        );
        cursor += chunk;
    }
    cursor - offset
}
