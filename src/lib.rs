//! A receiver-driven, priority-scheduled reliable RPC transport over
//! unreliable datagrams.
//!
//! Many concurrent request/response RPCs are multiplexed between peers over
//! a packet [`Driver`]. Senders transmit a round-trip's worth of bytes
//! unilaterally; beyond that the receiver paces them with GRANT packets,
//! favoring messages with the fewest bytes remaining (SRPT) and spreading
//! in-network packet priorities across senders. Lost packets are recovered
//! through timeout-driven RESENDs.
//!
//! A [`HomaTransport`] must be polled repeatedly from a single dispatcher
//! thread; see [`HomaTransport::poll`].

mod accumulator;
mod config;
mod handler;
mod outgoing;
mod rpcs;
mod sched;
mod session;
mod transport;
mod wire;

pub mod driver;
pub mod type_alias;
mod util;

pub use self::config::Config;
pub use self::driver::{Driver, UdpDriver};
pub use self::handler::Request;
pub use self::session::{RequestFuture, RpcError, RpcNotifier, SessionHandle};
pub use self::transport::HomaTransport;
pub use self::wire::RpcId;

#[cfg(test)]
mod tests;
