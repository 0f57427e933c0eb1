use std::time::Duration;
use tracing::debug;

use crate::seq_num::SeqNum;

/// Adaptive round-trip estimation and retransmission timeout.
///
/// Round-trip samples are folded into a running average by exponential smoothing with
///  a smoothing constant of 1/3. The arithmetic is integer-only and carries the
///  division remainder from one round to the next - plain integer division rounds
///  down every time, and without the carried remainder the average could never climb
///  on a stream of slightly-larger samples.
///
/// The retransmission timeout is twice the average round trip, clamped between the
///  configured minimum and the maximum retry age. The very first timeout equals the
///  maximum retry age to give the peer time to set up its receive side before we
///  start retransmitting into it.
pub struct RttEstimator {
    ave_rtt_millis: u64,
    rem_millis: u64,
    /// false until the first accepted sample replaces the initial guess outright
    ave_initialized: bool,
    rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    /// samples for chunks at or below this sequence number are not representative:
    ///  they were sent before the return channel was up and may have waited on it
    rtt_threshold: SeqNum,
    /// once this many samples were processed, the timeout may only grow; 0 disables
    stabilization_ack_count: u64,
}

impl RttEstimator {
    /// Initial estimated round trip time, used until the first sample is accepted.
    const INITIAL_AVE_RTT_MILLIS: u64 = 5_000;

    pub fn new(
        min_rto: Duration,
        max_rto: Duration,
        stabilization_ack_count: u64,
        initial_threshold: SeqNum,
    ) -> RttEstimator {
        RttEstimator {
            ave_rtt_millis: Self::INITIAL_AVE_RTT_MILLIS,
            rem_millis: 0,
            ave_initialized: false,
            rto: max_rto,
            min_rto,
            max_rto,
            rtt_threshold: initial_threshold,
            stabilization_ack_count,
        }
    }

    pub fn ave_rtt(&self) -> Duration {
        Duration::from_millis(self.ave_rtt_millis)
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Feeds one round-trip sample measured on an acknowledged chunk. `ack_count` is the
    ///  running number of sampled acknowledgements including this one; the first one
    ///  moves the representativeness threshold past everything sent so far.
    pub fn on_ack_sample(&mut self, sample: Duration, seq_num: SeqNum, current_seq: SeqNum, ack_count: u64) {
        if ack_count == 1 {
            self.rtt_threshold = current_seq.next();
        }

        if seq_num > self.rtt_threshold {
            let dt = sample.as_millis() as u64;
            if !self.ave_initialized {
                self.ave_rtt_millis = dt;
                self.ave_initialized = true;
            } else {
                let tmp = 6 * self.ave_rtt_millis + (6 * self.rem_millis) / 9 + 3 * dt;
                self.ave_rtt_millis = tmp / 9;
                self.rem_millis = tmp - self.ave_rtt_millis * 9;
            }
        }

        let new_rto = Duration::from_millis(self.ave_rtt_millis * 2);

        if self.stabilization_ack_count != 0 && ack_count > self.stabilization_ack_count {
            // the latency profile is established - do not let a few small sends shrink the
            //  timeout so far that the next big chunk retransmits immediately
            self.rto = self.rto.max(new_rto);
        } else {
            self.rto = new_rto.max(self.min_rto).min(self.max_rto);
        }

        debug!("RTT sample {:?} for chunk #{}, average RTT {}ms, RTO {:?}", sample, seq_num, self.ave_rtt_millis, self.rto);
    }

    /// Multiplicative backoff under sustained loss, bounded by the maximum retry age.
    pub fn double_rto(&mut self) {
        self.rto = (self.rto * 2).min(self.max_rto);
    }

    /// Fast recovery once traffic resumes after an idle period.
    pub fn reset_rto_to_min(&mut self) {
        self.rto = self.min_rto;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    const MIN_RTO: Duration = Duration::from_millis(500);
    const MAX_RTO: Duration = Duration::from_secs(60);

    fn estimator() -> RttEstimator {
        RttEstimator::new(MIN_RTO, MAX_RTO, 0, SeqNum::from_raw(50))
    }

    #[rstest]
    fn test_initial_rto_is_max_retry_age() {
        assert_eq!(estimator().rto(), MAX_RTO);
        assert_eq!(estimator().ave_rtt(), Duration::from_secs(5));
    }

    #[rstest]
    fn test_first_sampled_ack_moves_threshold() {
        let mut rtt = estimator();

        // chunk #10 was assigned before the first ACK arrived, so its sample is discarded,
        //  but the RTO is recomputed from the (initial) average
        rtt.on_ack_sample(Duration::from_millis(100), SeqNum::from_raw(10), SeqNum::from_raw(10), 1);
        assert_eq!(rtt.ave_rtt(), Duration::from_secs(5));
        assert_eq!(rtt.rto(), Duration::from_secs(10));
    }

    #[rstest]
    fn test_first_accepted_sample_replaces_initial_guess() {
        let mut rtt = estimator();
        rtt.on_ack_sample(Duration::from_millis(100), SeqNum::from_raw(3), SeqNum::from_raw(3), 1);

        rtt.on_ack_sample(Duration::from_millis(100), SeqNum::from_raw(10), SeqNum::from_raw(12), 2);
        assert_eq!(rtt.ave_rtt(), Duration::from_millis(100));
        assert_eq!(rtt.rto(), MIN_RTO);
    }

    #[rstest]
    fn test_smoothing_carries_remainder() {
        let mut rtt = estimator();
        rtt.on_ack_sample(Duration::from_millis(100), SeqNum::from_raw(3), SeqNum::from_raw(3), 1);
        rtt.on_ack_sample(Duration::from_millis(100), SeqNum::from_raw(10), SeqNum::from_raw(12), 2);

        // 6*100 + 0 + 3*130 = 990 -> ave 110, rem 0
        rtt.on_ack_sample(Duration::from_millis(130), SeqNum::from_raw(11), SeqNum::from_raw(13), 3);
        assert_eq!(rtt.ave_rtt(), Duration::from_millis(110));

        // 6*110 + 0 + 3*100 = 960 -> ave 106, rem 6
        rtt.on_ack_sample(Duration::from_millis(100), SeqNum::from_raw(12), SeqNum::from_raw(14), 4);
        assert_eq!(rtt.ave_rtt(), Duration::from_millis(106));

        // 6*106 + 36/9 + 3*100 = 940 -> ave 104, rem 4
        rtt.on_ack_sample(Duration::from_millis(100), SeqNum::from_raw(13), SeqNum::from_raw(15), 5);
        assert_eq!(rtt.ave_rtt(), Duration::from_millis(104));
    }

    #[rstest]
    fn test_rto_clamped_to_bounds() {
        let mut rtt = estimator();
        rtt.on_ack_sample(Duration::from_millis(10), SeqNum::from_raw(3), SeqNum::from_raw(3), 1);

        // 2 * 10ms is far below the minimum
        rtt.on_ack_sample(Duration::from_millis(10), SeqNum::from_raw(10), SeqNum::from_raw(12), 2);
        assert_eq!(rtt.rto(), MIN_RTO);

        // 2 * 2min exceeds the maximum retry age
        rtt.on_ack_sample(Duration::from_secs(120), SeqNum::from_raw(11), SeqNum::from_raw(13), 3);
        assert_eq!(rtt.rto(), MAX_RTO);
    }

    #[rstest]
    fn test_stabilization_prevents_rto_decrease() {
        let mut rtt = RttEstimator::new(MIN_RTO, MAX_RTO, 2, SeqNum::from_raw(50));
        rtt.on_ack_sample(Duration::from_millis(100), SeqNum::from_raw(3), SeqNum::from_raw(3), 1);
        rtt.on_ack_sample(Duration::from_secs(2), SeqNum::from_raw(10), SeqNum::from_raw(12), 2);
        assert_eq!(rtt.rto(), Duration::from_secs(4));

        // past the stabilization threshold a small sample may no longer shrink the RTO
        rtt.on_ack_sample(Duration::from_millis(100), SeqNum::from_raw(11), SeqNum::from_raw(13), 3);
        assert_eq!(rtt.rto(), Duration::from_secs(4));
    }

    #[rstest]
    fn test_backoff_and_recovery() {
        let mut rtt = estimator();
        rtt.reset_rto_to_min();
        assert_eq!(rtt.rto(), MIN_RTO);

        let mut previous = rtt.rto();
        for _ in 0..10 {
            rtt.double_rto();
            assert!(rtt.rto() >= previous);
            previous = rtt.rto();
        }
        assert_eq!(rtt.rto(), MAX_RTO);

        rtt.reset_rto_to_min();
        assert_eq!(rtt.rto(), MIN_RTO);
    }
}
