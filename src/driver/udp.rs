//! A non-blocking UDP packet driver.

use std::io::{self, ErrorKind as IoErrorKind};
use std::mem;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::AsRawFd;

use libc::c_int;

use super::pool::{PacketPool, PoolPacket};
use super::Driver;
use crate::wire::DataHeader;

/// Packet driver over a kernel UDP socket.
///
/// Packet priorities are mapped onto DSCP class selectors (CS0..CS7), which
/// only take effect if the network honors them; the transport's priority
/// logic is otherwise unaffected.
pub struct UdpDriver {
    socket: UdpSocket,
    local: SocketAddr,
    pool: PacketPool,
    tx_scratch: Vec<u8>,

    /// Last TOS byte stamped on the socket, to skip redundant setsockopts.
    last_tos: Option<u8>,
}

impl UdpDriver {
    /// Conventional Ethernet MTU minus IP and UDP headers.
    pub const MTU: usize = 1472;

    const NUM_PRIORITIES: u8 = 8;

    /// Create a driver bound to the given local address.
    pub fn new(bind: impl ToSocketAddrs) -> io::Result<Self> {
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        Ok(Self {
            socket,
            local,
            pool: PacketPool::new(Self::MTU),
            tx_scratch: Vec::with_capacity(Self::MTU),
            last_tos: None,
        })
    }

    /// Stamp the DSCP class selector for `priority` on the socket.
    fn apply_priority(&mut self, priority: u8) {
        let tos = priority.min(Self::NUM_PRIORITIES - 1) << 5;
        if self.last_tos == Some(tos) {
            return;
        }

        let val = c_int::from(tos);
        // SAFETY: plain setsockopt on a socket we own.
        let rc = unsafe {
            libc::setsockopt(
                self.socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_TOS,
                &val as *const c_int as *const libc::c_void,
                mem::size_of::<c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            log::debug!(
                "UdpDriver: failed to set IP_TOS for priority {}: {}",
                priority,
                io::Error::last_os_error()
            );
        }
        self.last_tos = Some(tos);
    }
}

impl Driver for UdpDriver {
    type Address = SocketAddr;
    type Packet = PoolPacket;

    #[inline]
    fn max_packet_data(&self) -> usize {
        Self::MTU - DataHeader::WIRE_SIZE
    }

    #[inline]
    fn highest_priority(&self) -> u8 {
        Self::NUM_PRIORITIES - 1
    }

    fn send(&mut self, dst: &SocketAddr, header: &[u8], payload: &[u8], priority: u8) {
        debug_assert!(header.len() + payload.len() <= Self::MTU, "oversized packet");
        self.apply_priority(priority);

        self.tx_scratch.clear();
        self.tx_scratch.extend_from_slice(header);
        self.tx_scratch.extend_from_slice(payload);
        match self.socket.send_to(&self.tx_scratch, dst) {
            Ok(_) => {}
            // The substrate is unreliable anyway; the transport recovers.
            Err(ref e) if e.kind() == IoErrorKind::WouldBlock => {
                log::trace!("UdpDriver: transmit queue full, dropping packet to {}", dst)
            }
            Err(e) => log::warn!("UdpDriver: send to {} failed: {}", dst, e),
        }
    }

    fn receive(&mut self, max: usize, sink: &mut Vec<(SocketAddr, PoolPacket)>) {
        for _ in 0..max {
            let mut pkt = self.pool.alloc();
            match self.socket.recv_from(pkt.storage_mut()) {
                Ok((len, src)) => {
                    pkt.set_len(len);
                    sink.push((src, pkt));
                }
                Err(ref e)
                    if matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) =>
                {
                    break
                }
                Err(e) => {
                    log::warn!("UdpDriver: receive failed: {}", e);
                    break;
                }
            }
        }
    }

    fn service_locator(&self) -> String {
        format!("homa+udp:host={},port={}", self.local.ip(), self.local.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_roundtrip() {
        let mut a = UdpDriver::new("127.0.0.1:0").unwrap();
        let mut b = UdpDriver::new("127.0.0.1:0").unwrap();
        let b_addr = b.local;

        a.send(&b_addr, b"hdr-", b"payload", 3);

        let mut sink = Vec::new();
        // Give the loopback a moment; non-blocking receive may race the send.
        for _ in 0..100 {
            b.receive(8, &mut sink);
            if !sink.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].1.as_ref(), b"hdr-payload");
    }
}
