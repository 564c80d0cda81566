//! Per-inbound-message state used by the grant scheduler.

use crate::wire::RpcId;

/// Lifecycle of a scheduled message.
///
/// A message starts in `New` while the transport decides where to place it,
/// then bounces between `Active` and `Inactive` until the final GRANT has
/// been emitted, which moves it to `FullyGranted` and off both lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchedState {
    New,
    Active,
    Inactive,
    FullyGranted,
}

/// Scheduling state for an inbound message that requires GRANTs, i.e. one
/// whose total length exceeds its unscheduled allowance. Request messages on
/// the server and response messages on the client both get one.
pub(crate) struct ScheduledMessage {
    /// Unique identifier for the RPC this message belongs to.
    pub rpc_id: RpcId,

    /// Hash of the sender's network address; the scheduler keeps the set of
    /// actively granted messages distinct by sender.
    pub sender_hash: u64,

    /// Total # bytes in the message.
    pub total_length: u32,

    /// Bytes not yet received. Mirrors the owning accumulator; refreshed on
    /// every data packet so the scheduler can order messages without
    /// chasing the accumulator down.
    pub bytes_remaining: u32,

    /// Offset from the most recent GRANT we have sent for this message, or
    /// its unscheduled allowance if we haven't sent any GRANT yet.
    pub grant_offset: u32,

    /// Packet priority embedded in the most recent GRANT.
    pub grant_priority: u8,

    pub state: SchedState,
}

impl ScheduledMessage {
    pub fn new(
        rpc_id: RpcId,
        sender_hash: u64,
        total_length: u32,
        unscheduled_bytes: u32,
        assembled: u32,
    ) -> Self {
        Self {
            rpc_id,
            sender_hash,
            total_length,
            bytes_remaining: total_length - assembled,
            grant_offset: unscheduled_bytes.min(total_length),
            grant_priority: 0,
            state: SchedState::New,
        }
    }

    /// SRPT precedence: fewer bytes remaining wins; equal remainders fall
    /// back to RPC id order so the outcome is deterministic.
    #[inline]
    pub fn precedes(&self, other: &ScheduledMessage) -> bool {
        (self.bytes_remaining, self.rpc_id) < (other.bytes_remaining, other.rpc_id)
    }

    #[inline(always)]
    pub fn fully_granted(&self) -> bool {
        self.grant_offset >= self.total_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(client_id: u64, sequence: u64, bytes_remaining: u32) -> ScheduledMessage {
        let mut m = ScheduledMessage::new(RpcId::new(client_id, sequence), 0, 1 << 20, 10_000, 0);
        m.bytes_remaining = bytes_remaining;
        m
    }

    #[test]
    fn test_srpt_order() {
        assert!(msg(1, 1, 100).precedes(&msg(1, 2, 200)));
        assert!(!msg(1, 1, 200).precedes(&msg(1, 2, 100)));
    }

    #[test]
    fn test_tie_break_is_deterministic() {
        let a = msg(1, 1, 100);
        let b = msg(1, 2, 100);
        assert!(a.precedes(&b));
        assert!(!b.precedes(&a));
    }

    #[test]
    fn test_grant_offset_clamped_to_total() {
        let m = ScheduledMessage::new(RpcId::new(1, 1), 0, 5_000, 10_000, 0);
        assert_eq!(m.grant_offset, 5_000);
        assert!(m.fully_granted());
    }
}
