//! The packet I/O abstraction consumed by the transport.

mod pool;
mod udp;

use std::fmt;
use std::hash::Hash;

pub use self::pool::PoolPacket;
pub use self::udp::UdpDriver;

/// Trait for a datagram packet driver.
///
/// The driver is an unreliable substrate: packets may be dropped, duplicated
/// or reordered, and the transport above is responsible for recovery. All
/// methods are non-blocking.
pub trait Driver {
    /// Network address of a peer transport.
    type Address: Clone + PartialEq + Eq + Hash + fmt::Debug + fmt::Display;

    /// A received packet. The caller owns it until dropped; dropping it
    /// returns the underlying buffer to the driver.
    type Packet: AsRef<[u8]>;

    /// Maximum number of message payload bytes that fit in one DATA packet.
    fn max_packet_data(&self) -> usize;

    /// Highest packet priority available, inclusive. Priorities run from 0.
    fn highest_priority(&self) -> u8;

    /// Bytes of transmit queue space currently available. The transport
    /// stops handing data packets to the driver when this reaches zero.
    fn tx_queue_space(&self) -> usize {
        usize::MAX
    }

    /// Hand one packet to the network: `header` followed by `payload`,
    /// stamped with `priority`.
    fn send(&mut self, dst: &Self::Address, header: &[u8], payload: &[u8], priority: u8);

    /// Move up to `max` received packets into `sink`.
    fn receive(&mut self, max: usize, sink: &mut Vec<(Self::Address, Self::Packet)>);

    /// Register a memory region with the driver, for drivers capable of
    /// zero-copy access to application memory.
    fn register_memory(&mut self, _base: *mut u8, _bytes: usize) {}

    /// Locator string describing this driver instance.
    fn service_locator(&self) -> String;
}
