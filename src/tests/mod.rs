#![allow(unused_imports)]

//! End-to-end tests over a deterministic in-memory packet network.
//!
//! `SimDriver` connects transports through shared queues, records a trace of
//! every packet sent (opcode, RPC id, offsets, flags, priorities) and can
//! drop or duplicate packets matching a rule, which makes the loss-recovery
//! and scheduling scenarios reproducible.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use log::LevelFilter;
use quanta::{Clock, Mock};
use rand::Rng;
use simple_logger::SimpleLogger;

use crate::driver::Driver;
use crate::session::{RpcError, RpcNotifier};
use crate::wire::*;
use crate::{Config, HomaTransport};

mod large;
mod recovery;

pub(self) fn init_logging() {
    let _ = SimpleLogger::new().with_level(LevelFilter::Warn).init();
}

/// One packet as observed on the simulated wire.
#[derive(Debug, Clone)]
pub(self) struct TraceRecord {
    pub src: u16,
    pub dst: u16,
    pub opcode: u8,
    pub rpc_id: RpcId,
    pub flags: u8,
    /// DATA/GRANT/RESEND offset field.
    pub offset: u32,
    /// DATA total length, RESEND length, or ALL_DATA message length.
    pub aux: u32,
    /// The priority field embedded in GRANT/RESEND packets.
    pub embedded_priority: u8,
    /// Driver-level packet priority.
    pub priority: u8,
}

impl TraceRecord {
    pub fn is(&self, opcode: PacketOpcode) -> bool {
        self.opcode == opcode as u8
    }
}

fn parse_record(src: u16, dst: u16, bytes: &[u8], priority: u8) -> Option<TraceRecord> {
    let common = CommonHeader::from_bytes(bytes)?;
    let mut rec = TraceRecord {
        src,
        dst,
        opcode: common.opcode(),
        rpc_id: common.rpc_id(),
        flags: common.flags(),
        offset: 0,
        aux: 0,
        embedded_priority: 0,
        priority,
    };
    match PacketOpcode::from_u8(common.opcode())? {
        PacketOpcode::AllData => {
            let hdr = AllDataHeader::from_bytes(bytes)?;
            rec.aux = u32::from(hdr.message_length());
        }
        PacketOpcode::Data => {
            let hdr = DataHeader::from_bytes(bytes)?;
            rec.offset = hdr.offset();
            rec.aux = hdr.total_length();
        }
        PacketOpcode::Grant => {
            let hdr = GrantHeader::from_bytes(bytes)?;
            rec.offset = hdr.offset();
            rec.embedded_priority = hdr.priority();
        }
        PacketOpcode::Resend => {
            let hdr = ResendHeader::from_bytes(bytes)?;
            rec.offset = hdr.offset();
            rec.aux = hdr.length();
            rec.embedded_priority = hdr.priority();
        }
        _ => {}
    }
    Some(rec)
}

type PacketRule = Box<dyn FnMut(&TraceRecord) -> bool>;

struct NetInner {
    queues: HashMap<u16, VecDeque<(u16, Vec<u8>)>>,
    trace: Vec<TraceRecord>,
    drop_rule: Option<PacketRule>,
    duplicate_rule: Option<PacketRule>,
    mtu_data: usize,
}

/// A simulated network connecting any number of `SimDriver`s.
#[derive(Clone)]
pub(self) struct TestNet {
    inner: Rc<RefCell<NetInner>>,
}

impl TestNet {
    pub fn new(mtu_data: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(NetInner {
                queues: HashMap::new(),
                trace: Vec::new(),
                drop_rule: None,
                duplicate_rule: None,
                mtu_data,
            })),
        }
    }

    pub fn driver(&self, addr: u16) -> SimDriver {
        self.inner.borrow_mut().queues.entry(addr).or_default();
        SimDriver {
            net: self.inner.clone(),
            addr,
        }
    }

    pub fn trace(&self) -> Vec<TraceRecord> {
        self.inner.borrow().trace.clone()
    }

    /// Packets matching `rule` are recorded in the trace but not delivered.
    pub fn drop_when(&self, rule: impl FnMut(&TraceRecord) -> bool + 'static) {
        self.inner.borrow_mut().drop_rule = Some(Box::new(rule));
    }

    /// Packets matching `rule` are delivered twice.
    pub fn duplicate_when(&self, rule: impl FnMut(&TraceRecord) -> bool + 'static) {
        self.inner.borrow_mut().duplicate_rule = Some(Box::new(rule));
    }

    /// GRANT offsets sent for `rpc_id` with the given direction flag.
    pub fn grants_to(&self, rpc_id: RpcId, from_client: bool) -> Vec<u32> {
        self.inner
            .borrow()
            .trace
            .iter()
            .filter(|r| {
                r.is(PacketOpcode::Grant)
                    && r.rpc_id == rpc_id
                    && (r.flags & FROM_CLIENT != 0) == from_client
            })
            .map(|r| r.offset)
            .collect()
    }
}

/// Driver endpoint on a [`TestNet`].
pub(self) struct SimDriver {
    net: Rc<RefCell<NetInner>>,
    addr: u16,
}

impl Driver for SimDriver {
    type Address = u16;
    type Packet = Vec<u8>;

    fn max_packet_data(&self) -> usize {
        self.net.borrow().mtu_data
    }

    fn highest_priority(&self) -> u8 {
        7
    }

    fn send(&mut self, dst: &u16, header: &[u8], payload: &[u8], priority: u8) {
        let mut bytes = Vec::with_capacity(header.len() + payload.len());
        bytes.extend_from_slice(header);
        bytes.extend_from_slice(payload);

        let mut net = self.net.borrow_mut();
        let mut copies = 1;
        if let Some(rec) = parse_record(self.addr, *dst, &bytes, priority) {
            if net.drop_rule.as_mut().map_or(false, |rule| rule(&rec)) {
                copies = 0;
            } else if net
                .duplicate_rule
                .as_mut()
                .map_or(false, |rule| rule(&rec))
            {
                copies = 2;
            }
            net.trace.push(rec);
        }
        for _ in 0..copies {
            net.queues
                .entry(*dst)
                .or_default()
                .push_back((self.addr, bytes.clone()));
        }
    }

    fn receive(&mut self, max: usize, sink: &mut Vec<(u16, Vec<u8>)>) {
        let mut net = self.net.borrow_mut();
        let Some(queue) = net.queues.get_mut(&self.addr) else {
            return;
        };
        for _ in 0..max {
            match queue.pop_front() {
                Some((src, bytes)) => sink.push((src, bytes)),
                None => break,
            }
        }
    }

    fn service_locator(&self) -> String {
        format!("homa+sim:addr={}", self.addr)
    }
}

/// Where a notifier parks its outcome.
pub(self) type Outcome = Rc<RefCell<Option<Result<Vec<u8>, RpcError>>>>;

struct SlotNotifier(Outcome);

impl RpcNotifier for SlotNotifier {
    fn completed(&mut self, response: Vec<u8>) {
        *self.0.borrow_mut() = Some(Ok(response));
    }

    fn failed(&mut self, error: RpcError) {
        *self.0.borrow_mut() = Some(Err(error));
    }
}

pub(self) fn notifier() -> (Box<dyn RpcNotifier>, Outcome) {
    let slot: Outcome = Rc::new(RefCell::new(None));
    (Box::new(SlotNotifier(slot.clone())), slot)
}

/// Poll all transports round-robin until `cond` holds (true) or the
/// iteration budget runs out (false).
pub(self) fn run_until(
    transports: &[&HomaTransport<SimDriver>],
    mut cond: impl FnMut() -> bool,
    max_iters: usize,
) -> bool {
    for _ in 0..max_iters {
        if cond() {
            return true;
        }
        for t in transports {
            t.poll();
        }
    }
    cond()
}

pub(self) fn run(transports: &[&HomaTransport<SimDriver>], iters: usize) {
    for _ in 0..iters {
        for t in transports {
            t.poll();
        }
    }
}

pub(self) fn random_payload(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// An echo server on `addr`.
pub(self) fn echo_server(net: &TestNet, addr: u16, client_id: u64, config: Config) -> HomaTransport<SimDriver> {
    let server = HomaTransport::new(net.driver(addr), client_id, config);
    server.set_handler(|req| async move { req.into_payload() });
    server
}

/// Transports sharing a mock clock, so tests can step time by hand.
pub(self) fn mock_clock() -> (Clock, Arc<Mock>) {
    Clock::mock()
}

pub(self) fn tick(mock: &Mock, interval: Duration) {
    mock.increment(interval);
}
