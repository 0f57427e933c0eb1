use std::cmp::{max, min};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::message::{self, Message};
use crate::send_stream::{QueueState, StreamShared};
use crate::seq_num::SeqNum;

/// The recurring retransmission and staleness check of one stream.
///
/// There is at most one pending scheduled check per stream; rescheduling replaces and
///  cancels the previous one. Each check evaluates the timers, retransmits what is
///  due, adapts the timeout and schedules its successor - a chain of cancellable
///  tasks rather than a callback recursively scheduling itself.
pub(crate) struct Retransmitter;

impl Retransmitter {
    /// Schedules a check after `delay`, cancelling any still-pending one.
    pub(crate) fn schedule(shared: Arc<StreamShared>, delay: Duration) {
        let task_shared = shared.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // The check runs in its own task so a fault in it is observed here. A check
            //  that dies without closing the stream would leave a connection that can
            //  never be declared stale.
            let check = tokio::spawn(Self::run_check(task_shared.clone()));
            if let Err(e) = check.await {
                if e.is_panic() {
                    error!("retransmission check failed: {}", e);
                    task_shared.hard_close().await;
                }
            }
        });

        let mut slot = shared.retransmit_task.lock()
            .expect("retransmit task slot poisoned");
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    /// Forces a re-evaluation right away, e.g. after an acknowledgement or a close.
    pub(crate) fn schedule_immediate(shared: Arc<StreamShared>) {
        Self::schedule(shared, Duration::ZERO);
    }

    async fn run_check(shared: Arc<StreamShared>) {
        let now = Instant::now();

        // a dead peer stops ACKing long before the application notices - if the
        //  connection has idled out completely, give up on it
        let idle = now.saturating_duration_since(shared.outgoing.last_accessed());
        if idle > shared.outgoing.idle_timeout() {
            info!("connection idle for {:?}, giving up", idle);
            shared.hard_close().await;
            return;
        }

        let mut queue = shared.queue.lock().await;

        if let Some(deadline) = queue.close_deadline {
            if deadline <= now {
                drop(queue);
                shared.hard_close().await;
                return;
            }
        }

        let rto = queue.rtt.rto();

        // a retransmission recently triggered by selective-ack feedback gets one
        //  timeout's worth of time to take effect before the timer acts again
        let since_sack_retrans = now.saturating_duration_since(queue.sack_retrans_time);
        if since_sack_retrans < rto {
            debug!("selective-ack retransmission {:?} ago, deferring", since_sack_retrans);
            let next_delay = Self::next_delay(&queue, now);
            drop(queue);
            Self::schedule(shared, next_delay);
            return;
        }

        let since_last_ack = now.saturating_duration_since(queue.last_ack_time);
        let oldest_in_queue_wait = queue.retry_queue.front()
            .map(|e| now.saturating_duration_since(e.enqueued_at))
            .unwrap_or(Duration::ZERO);

        debug!("last ACK {:?} ago, oldest queued chunk {:?} old", since_last_ack, oldest_in_queue_wait);

        if oldest_in_queue_wait > shared.outgoing.max_retry_age() {
            info!("connection is stale, oldest chunk {:?} old", oldest_in_queue_wait);
            drop(queue);
            shared.hard_close().await;
            return;
        }

        let real_wait = max(since_last_ack, oldest_in_queue_wait);

        // Retransmit only if the timeout expired for the stream as a whole *and* for the
        //  oldest chunk - a freshly sent chunk must not be duplicated just because the
        //  last ACK is old.
        if real_wait >= rto && oldest_in_queue_wait >= rto {
            let rwindow = queue.rwindow;
            let ave_rtt = queue.rtt.ave_rtt();
            let batch = queue.retry_queue.select_for_retransmit(rwindow as usize, now, ave_rtt);
            drop(queue);

            debug!("retransmission due, window {}", rwindow);
            let retransmitted = Self::send_batch(&shared, batch).await;

            let mut queue = shared.queue.lock().await;
            queue.n_retransmitted += retransmitted as u64;
            queue.n_at_this_rto += retransmitted;
            queue.idle_counter = 0;

            // the peer may be unreachable: back off once a full window was retransmitted
            //  at this timeout with no response for twice its duration
            if retransmitted > 0 && real_wait >= rto * 2 && queue.n_at_this_rto >= rwindow * 2 {
                queue.rtt.double_rto();
                queue.n_at_this_rto = 0;
            }

            debug!("retransmitted {} chunks, {} at RTO {:?}, {} overall",
                retransmitted, queue.n_at_this_rto, queue.rtt.rto(), queue.n_retransmitted);

            let next_delay = Self::next_delay(&queue, Instant::now());
            drop(queue);
            Self::schedule(shared, next_delay);
        } else {
            queue.idle_counter += 1;
            if queue.idle_counter == 2 {
                // nothing needed retransmission for two full cycles - recover quickly
                //  once traffic resumes
                queue.rtt.reset_rto_to_min();
                queue.idle_counter = 0;
                queue.n_at_this_rto = 0;
            }
            debug!("idle cycle: RTO {:?}, waited {:?}", queue.rtt.rto(), real_wait);

            let next_delay = Self::next_delay(&queue, Instant::now());
            drop(queue);
            Self::schedule(shared, next_delay);
        }
    }

    /// The next check runs after one timeout, but a lingering stream must be
    ///  re-examined at its deadline so it does not outlive the linger delay.
    fn next_delay(queue: &QueueState, now: Instant) -> Duration {
        let rto = queue.rtt.rto();
        match queue.close_deadline {
            Some(deadline) => min(rto, deadline.saturating_duration_since(now)),
            None => rto,
        }
    }

    /// Sends the selected batch, oldest first. A failed or rejected send means the
    ///  channel is unusable right now - the rest of the batch keeps its place in the
    ///  queue and waits for the next cycle.
    async fn send_batch(shared: &Arc<StreamShared>, batch: Vec<(SeqNum, Message)>) -> u32 {
        let mut sent = Vec::new();

        for (seq_num, mut msg) in batch {
            msg.replace_element(
                message::NAMESPACE,
                message::RETRY_ELEMENT_NAME,
                Bytes::from_static(message::RETRY_ELEMENT_VALUE),
            );
            debug!("retransmitting chunk #{}", seq_num);

            match shared.outgoing.send(msg).await {
                Ok(true) => {
                    shared.remote_free_space.fetch_sub(1, Ordering::AcqRel);
                    sent.push(seq_num);
                }
                Ok(false) => {
                    debug!("channel did not accept retransmission of chunk #{}, stopping batch", seq_num);
                    break;
                }
                Err(e) => {
                    debug!("retransmission of chunk #{} failed: {}, stopping batch", seq_num, e);
                    break;
                }
            }
        }

        if !sent.is_empty() {
            shared.queue.lock().await
                .retry_queue.mark_sent(&sent, Instant::now());
        }
        sent.len() as u32
    }
}
