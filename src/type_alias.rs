//! Type aliases used in this library.

/// [`u64`]: Unique identifier for the client end of a transport instance.
/// Stamped into every RPC id this transport issues; must be unique across
/// all transports in the cluster.
pub type ClientId = u64;

/// [`u64`]: Per-client RPC sequence number, monotonically increasing.
pub type Sequence = u64;
