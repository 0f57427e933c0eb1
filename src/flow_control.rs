use std::time::Duration;
#[cfg(test)] use mockall::automock;

use crate::seq_num::SeqNum;

/// Pluggable policy computing the allowed in-flight window from acknowledgement
///  events and round-trip timing.
///
/// All callbacks run under the retry queue's lock, bracketed by `ack_event_begin` /
///  `ack_event_end` per processed acknowledgement. The sender and the retransmitter
///  treat the returned window purely as an advisory cap on in-flight chunks and on
///  retransmission batch size.
#[cfg_attr(test, automock)]
pub trait FlowControl: Send + 'static {
    /// The currently recommended window, in chunks.
    fn rwindow(&self) -> u32;

    fn ack_event_begin(&mut self);

    fn packet_acked(&mut self, seq_num: SeqNum);

    /// A chunk confirmed missing below the selective-acknowledgement ceiling. Adaptive
    ///  policies use this to shrink the window or drive more aggressive retransmission.
    fn packet_missing(&mut self, seq_num: SeqNum);

    /// Called after all per-chunk callbacks of one acknowledgement; returns the new
    ///  recommended window.
    fn ack_event_end(&mut self, remote_max_queue_size: usize, ave_rtt: Duration, last_rtt: Duration) -> u32;
}

/// The default policy: a constant window, ignoring all feedback.
pub struct FixedFlowControl {
    rwindow: u32,
}

impl FixedFlowControl {
    pub const DEFAULT_RWINDOW: u32 = 20;

    pub fn new(rwindow: u32) -> FixedFlowControl {
        FixedFlowControl { rwindow }
    }
}

impl Default for FixedFlowControl {
    fn default() -> Self {
        FixedFlowControl::new(Self::DEFAULT_RWINDOW)
    }
}

impl FlowControl for FixedFlowControl {
    fn rwindow(&self) -> u32 {
        self.rwindow
    }

    fn ack_event_begin(&mut self) {
    }

    fn packet_acked(&mut self, _seq_num: SeqNum) {
    }

    fn packet_missing(&mut self, _seq_num: SeqNum) {
    }

    fn ack_event_end(&mut self, _remote_max_queue_size: usize, _ave_rtt: Duration, _last_rtt: Duration) -> u32 {
        self.rwindow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    fn test_fixed_window_ignores_feedback() {
        let mut fc = FixedFlowControl::default();
        assert_eq!(fc.rwindow(), FixedFlowControl::DEFAULT_RWINDOW);

        fc.ack_event_begin();
        fc.packet_acked(SeqNum::from_raw(1));
        fc.packet_missing(SeqNum::from_raw(2));
        let rwindow = fc.ack_event_end(50, Duration::from_millis(100), Duration::from_millis(120));

        assert_eq!(rwindow, FixedFlowControl::DEFAULT_RWINDOW);
        assert_eq!(FixedFlowControl::new(7).rwindow(), 7);
    }
}
