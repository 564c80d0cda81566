//! Per-outbound-message transmit state.

use quanta::Instant;

/// An outgoing message: the request of a client RPC or the response of a
/// server RPC. Bytes up to `transmit_offset` have been handed to the driver;
/// bytes up to `transmit_limit` may be. The limit starts at the unscheduled
/// allowance and is advanced only by received GRANTs.
pub(crate) struct OutgoingMessage {
    /// The message contents.
    pub buffer: Vec<u8>,

    /// Offset of the next byte to transmit; all preceding bytes have
    /// already been sent at least once.
    pub transmit_offset: u32,

    /// Bytes before this offset may be transmitted; bytes after it must
    /// wait for a GRANT. Never exceeds the message length.
    pub transmit_limit: u32,

    /// Packet priority for transmitting up to `transmit_limit`. Set before
    /// the first byte goes out, then follows received GRANTs.
    pub transmit_priority: u8,

    /// # bytes that can be sent unilaterally.
    pub unscheduled_bytes: u32,

    /// When data bytes of this message were last handed to the driver.
    pub last_transmit_time: Option<Instant>,

    /// True means this message is among the sender's top outgoing messages
    /// with fewest bytes left.
    pub top_choice: bool,
}

impl OutgoingMessage {
    pub fn new(buffer: Vec<u8>, unscheduled_bytes: u32, transmit_priority: u8) -> Self {
        let total = buffer.len() as u32;
        Self {
            buffer,
            transmit_offset: 0,
            transmit_limit: unscheduled_bytes.min(total),
            transmit_priority,
            unscheduled_bytes,
            last_transmit_time: None,
            top_choice: false,
        }
    }

    #[inline(always)]
    pub fn total_length(&self) -> u32 {
        self.buffer.len() as u32
    }

    #[inline(always)]
    pub fn bytes_remaining(&self) -> u32 {
        self.total_length() - self.transmit_offset
    }

    /// True if the message has bytes it is allowed to transmit right now.
    #[inline(always)]
    pub fn ready(&self) -> bool {
        self.transmit_offset < self.transmit_limit
    }

    #[inline(always)]
    pub fn fully_transmitted(&self) -> bool {
        self.transmit_offset >= self.total_length()
    }

    /// Apply a received GRANT. Non-monotone grants are duplicates and
    /// ignored. Returns `true` if the transmit limit advanced.
    pub fn handle_grant(&mut self, offset: u32, priority: u8) -> bool {
        let new_limit = offset.min(self.total_length());
        if new_limit <= self.transmit_limit {
            return false;
        }
        self.transmit_limit = new_limit;
        self.transmit_priority = priority;
        true
    }

    /// The receiver has lost all state for this message; start over from
    /// scratch with only the unscheduled allowance.
    pub fn restart(&mut self) {
        self.transmit_offset = 0;
        self.transmit_limit = self.unscheduled_bytes.min(self.total_length());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_starts_at_unscheduled_allowance() {
        let m = OutgoingMessage::new(vec![0; 500], 300, 6);
        assert_eq!(m.transmit_limit, 300);
        assert!(m.ready());

        let small = OutgoingMessage::new(vec![0; 100], 300, 7);
        assert_eq!(small.transmit_limit, 100);
    }

    #[test]
    fn test_grant_monotone() {
        let mut m = OutgoingMessage::new(vec![0; 1000], 300, 6);
        assert!(m.handle_grant(600, 2));
        assert_eq!(m.transmit_limit, 600);
        assert_eq!(m.transmit_priority, 2);

        // Duplicate and stale grants change nothing.
        assert!(!m.handle_grant(600, 5));
        assert!(!m.handle_grant(400, 5));
        assert_eq!(m.transmit_priority, 2);

        // Grants past the end are clamped.
        assert!(m.handle_grant(5000, 1));
        assert_eq!(m.transmit_limit, 1000);
    }

    #[test]
    fn test_restart() {
        let mut m = OutgoingMessage::new(vec![0; 1000], 300, 6);
        m.handle_grant(800, 2);
        m.transmit_offset = 700;
        m.restart();
        assert_eq!(m.transmit_offset, 0);
        assert_eq!(m.transmit_limit, 300);
    }
}
