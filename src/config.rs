//! Transport tunables and the derived packet-priority plan.

use std::time::Duration;

/// Recognized transport options.
///
/// A zero value for `grant_increment` or `max_granted_messages` selects the
/// built-in default derived from the other options at transport construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of bytes corresponding to a round-trip time between two
    /// machines. Senders may transmit this many initial bytes without
    /// receiving a GRANT, and the receiver paces GRANTs to keep this many
    /// unreceived bytes granted per active message.
    pub round_trip_bytes: u32,

    /// How many bytes each new GRANT extends the granted range by.
    /// Zero means "follow `round_trip_bytes`".
    pub grant_increment: u32,

    /// Maximum number of distinct-sender inbound messages granted
    /// concurrently (the degree of overcommitment). Zero means "one per
    /// scheduled priority level".
    pub max_granted_messages: u32,

    /// Maximum number of bytes of a single partially-received message that
    /// may be retained in stolen driver buffers. Beyond this, out-of-order
    /// fragments are copied out and the driver buffer released immediately,
    /// so one stuck message cannot starve the driver of receive buffers.
    pub message_zero_copy_threshold: u32,

    /// Messages no longer than this are transmitted inline at send time,
    /// bypassing the transmit scheduler entirely.
    pub small_message_threshold: u32,

    /// Size brackets for unscheduled-traffic priority selection. Must be
    /// strictly increasing; a `u32::MAX` sentinel is appended if absent.
    /// The bracket at index `i` maps to the `(i+1)`-th highest priority.
    pub unsched_prio_cutoffs: Vec<u32>,

    /// Number of silent timer ticks after which an RPC is abandoned.
    pub timeout_intervals: u32,

    /// Number of silent timer ticks after which the peer is probed with a
    /// RESEND (or answered with BUSY).
    pub ping_intervals: u32,

    /// Interval between timeout checks.
    pub timer_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            round_trip_bytes: 10_000,
            grant_increment: 0,
            max_granted_messages: 0,
            message_zero_copy_threshold: 16_384,
            small_message_threshold: 300,
            unsched_prio_cutoffs: vec![469, 5521, 15267],
            timeout_intervals: 100,
            ping_intervals: 3,
            timer_interval: Duration::from_millis(1),
        }
    }
}

/// The packet-priority layout derived from a [`Config`] and the highest
/// priority the driver makes available.
///
/// Priorities split into two disjoint bands: scheduled traffic uses
/// `[0, highest_sched]`, unscheduled traffic uses
/// `[lowest_unsched, highest_avail]`. With a single available priority both
/// bands collapse to zero.
#[derive(Debug, Clone)]
pub(crate) struct PriorityPlan {
    /// Highest priority supported by the driver.
    pub highest_avail: u8,

    /// Lowest priority used for unscheduled traffic.
    pub lowest_unsched: u8,

    /// Highest priority used for scheduled traffic.
    pub highest_sched: u8,

    /// Cutoffs for unscheduled priority selection, sentinel-terminated.
    cutoffs: Vec<u32>,
}

impl PriorityPlan {
    pub fn new(highest_avail: u8, cutoffs: &[u32]) -> Self {
        assert!(
            cutoffs.windows(2).all(|w| w[0] < w[1]),
            "unscheduled priority cutoffs must be strictly increasing"
        );
        let mut cutoffs = cutoffs.to_vec();
        if cutoffs.last() != Some(&u32::MAX) {
            cutoffs.push(u32::MAX);
        }

        let (lowest_unsched, highest_sched) = if highest_avail == 0 {
            (0, 0)
        } else {
            // Give the top brackets to unscheduled traffic, but leave at
            // least priority 0 for the scheduled band.
            let num_unsched = cutoffs.len().min(highest_avail as usize) as u8;
            let lowest_unsched = (highest_avail + 1 - num_unsched).max(1);
            (lowest_unsched, lowest_unsched - 1)
        };

        Self {
            highest_avail,
            lowest_unsched,
            highest_sched,
            cutoffs,
        }
    }

    /// Number of priority levels available to the scheduled band.
    #[inline]
    pub fn num_sched_prios(&self) -> u32 {
        u32::from(self.highest_sched) + 1
    }

    /// Priority for the unscheduled portion of a message of `message_length`
    /// bytes: the smallest bracket that fits the message maps to the highest
    /// priority, the next bracket one below, and so on.
    pub fn unsched_priority(&self, message_length: u32) -> u8 {
        let bracket = self
            .cutoffs
            .iter()
            .position(|&cutoff| cutoff >= message_length)
            .expect("cutoff vector has no sentinel") as u8;
        self.highest_avail
            .saturating_sub(bracket)
            .max(self.lowest_unsched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_split() {
        let plan = PriorityPlan::new(7, &[469, 5521, 15267]);
        assert_eq!(plan.lowest_unsched, 4);
        assert_eq!(plan.highest_sched, 3);
        assert_eq!(plan.num_sched_prios(), 4);
    }

    #[test]
    fn test_unsched_brackets() {
        let plan = PriorityPlan::new(7, &[469, 5521, 15267]);
        assert_eq!(plan.unsched_priority(0), 7);
        assert_eq!(plan.unsched_priority(469), 7);
        assert_eq!(plan.unsched_priority(470), 6);
        assert_eq!(plan.unsched_priority(5521), 6);
        assert_eq!(plan.unsched_priority(15267), 5);
        assert_eq!(plan.unsched_priority(15268), 4);
        assert_eq!(plan.unsched_priority(u32::MAX), 4);
    }

    #[test]
    fn test_single_priority_collapses() {
        let plan = PriorityPlan::new(0, &[469]);
        assert_eq!(plan.lowest_unsched, 0);
        assert_eq!(plan.highest_sched, 0);
        assert_eq!(plan.unsched_priority(1 << 20), 0);
    }

    #[test]
    fn test_more_brackets_than_priorities() {
        // Scheduled traffic always keeps priority 0 to itself.
        let plan = PriorityPlan::new(2, &[100, 200, 300, 400]);
        assert_eq!(plan.lowest_unsched, 1);
        assert_eq!(plan.highest_sched, 0);
        assert_eq!(plan.unsched_priority(1000), 1);
    }

    #[test]
    #[should_panic(expected = "strictly increasing")]
    fn test_bad_cutoffs() {
        PriorityPlan::new(7, &[500, 500]);
    }
}
