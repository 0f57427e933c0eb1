use std::cmp::min;
use std::time::Duration;
use tokio::time::Instant;

use crate::message::Message;
use crate::seq_num::SeqNum;

/// One chunk pending acknowledgement.
pub(crate) struct RetryEntry {
    pub(crate) seq_num: SeqNum,
    pub(crate) msg: Message,
    /// when the chunk was first enqueued; basis for round-trip samples and staleness
    pub(crate) enqueued_at: Instant,
    /// when the chunk was last handed to the channel
    pub(crate) sent_at: Instant,
    /// number of retransmissions so far
    pub(crate) marked: u32,
}

impl RetryEntry {
    pub(crate) fn new(seq_num: SeqNum, msg: Message) -> RetryEntry {
        let now = Instant::now();
        RetryEntry {
            seq_num,
            msg,
            enqueued_at: now,
            sent_at: now,
            marked: 0,
        }
    }
}

/// The chunks pending acknowledgement, in ascending sequence order.
///
/// Since sequence numbers are assigned monotonically and chunks are appended in
///  assignment order, insertion order and sequence order coincide. All access goes
///  through the owning stream's queue lock.
#[derive(Default)]
pub(crate) struct RetryQueue {
    entries: Vec<RetryEntry>,
}

impl RetryQueue {
    pub(crate) fn push(&mut self, entry: RetryEntry) {
        debug_assert!(
            self.entries.last().map(|e| e.seq_num < entry.seq_num).unwrap_or(true),
            "retry queue must stay strictly ordered by sequence number"
        );
        self.entries.push(entry);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn front(&self) -> Option<&RetryEntry> {
        self.entries.first()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Removes every entry covered by a cumulative acknowledgement, i.e. with a
    ///  sequence number at or below the given one. Because the queue is ordered,
    ///  this is always a prefix.
    pub(crate) fn remove_cumulative(&mut self, cumulative: SeqNum) -> Vec<RetryEntry> {
        let cut = self.entries.partition_point(|e| e.seq_num <= cumulative);
        self.entries.drain(..cut).collect()
    }

    /// Walks the queue in lock-step with the sorted selective-acknowledgement list.
    ///  Entries found in the list are removed; entries skipped over by a larger list
    ///  value (and above the cumulative acknowledgement) are confirmed holes on the
    ///  receiver side. Entries beyond the last list value are left untouched.
    pub(crate) fn remove_selective(&mut self, cumulative: SeqNum, sack_list: &[SeqNum]) -> (Vec<RetryEntry>, Vec<SeqNum>) {
        let mut removed = Vec::new();
        let mut holes = Vec::new();

        let mut sack_idx = 0;
        let mut i = 0;
        while i < self.entries.len() {
            let seq_num = self.entries[i].seq_num;

            while sack_idx < sack_list.len() && sack_list[sack_idx] < seq_num {
                sack_idx += 1;
            }
            if sack_idx == sack_list.len() {
                break;
            }

            if sack_list[sack_idx] == seq_num {
                removed.push(self.entries.remove(i));
            } else {
                if cumulative < seq_num {
                    holes.push(seq_num);
                }
                i += 1;
            }
        }

        (removed, holes)
    }

    /// Selects up to `rwin` entries due for retransmission, marks them and returns
    ///  clones of their messages for sending.
    ///
    /// A chunk that was never retransmitted gets more grace: it may simply have been
    ///  reordered, and reordered chunks rarely arrive later than 1.2 times the average
    ///  round trip. A chunk already retransmitted is suspected lost, so it becomes
    ///  eligible again after a single average round trip.
    pub(crate) fn select_for_retransmit(&mut self, rwin: usize, now: Instant, ave_rtt: Duration) -> Vec<(SeqNum, Message)> {
        let number_to_scan = min(self.entries.len(), rwin);

        let mut batch = Vec::new();
        for entry in self.entries.iter_mut().take(number_to_scan) {
            let since_sent = now.saturating_duration_since(entry.sent_at);
            if entry.marked == 0 {
                if since_sent < ave_rtt * 6 / 5 {
                    continue;
                }
            } else if since_sent < ave_rtt {
                continue;
            }

            entry.marked += 1;
            batch.push((entry.seq_num, entry.msg.clone()));
        }
        batch
    }

    /// Stamps the given entries as sent just now. Called after the channel accepted
    ///  their retransmission.
    pub(crate) fn mark_sent(&mut self, seq_nums: &[SeqNum], now: Instant) {
        for entry in self.entries.iter_mut() {
            if seq_nums.contains(&entry.seq_num) {
                entry.sent_at = now;
            }
        }
    }
}
