use std::cmp::min;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::ack::Acknowledgement;
use crate::config::ReliableStreamConfig;
use crate::error::{Error, Result};
use crate::flow_control::{FixedFlowControl, FlowControl};
use crate::message::{self, Message};
use crate::outgoing::Outgoing;
use crate::retransmitter::Retransmitter;
use crate::retry_queue::{RetryEntry, RetryQueue};
use crate::rtt::RttEstimator;
use crate::seq_num::SeqNum;

/// Sentinel in `linger_millis` for 'keep retransmitting indefinitely'.
const LINGER_UNBOUNDED: u64 = u64::MAX;

/// Upper bound on one admission-control wait. Waiters are woken explicitly on every
///  acknowledgement and on close; the periodic re-check is a safety net on top.
const ADMISSION_RECHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Everything guarded by the retry queue's lock.
pub(crate) struct QueueState {
    pub(crate) retry_queue: RetryQueue,
    pub(crate) rtt: RttEstimator,
    pub(crate) flow_control: Box<dyn FlowControl>,
    /// cache of the most recent window recommendation
    pub(crate) rwindow: u32,
    /// running-average bookkeeping of the peer's input queue occupancy
    pub(crate) iq_tests: u64,
    pub(crate) ave_iq_size: u64,
    pub(crate) last_ack_time: Instant,
    /// when a retransmission was last triggered by selective-ack feedback
    pub(crate) sack_retrans_time: Instant,
    /// when a closing stream stops retransmitting and becomes terminal; None while the
    ///  stream is open, or when it lingers indefinitely
    pub(crate) close_deadline: Option<Instant>,
    /// retransmissions since the retransmission timeout last changed
    pub(crate) n_at_this_rto: u32,
    pub(crate) n_retransmitted: u64,
    /// consecutive retransmitter cycles with nothing to do
    pub(crate) idle_counter: u32,
}

struct WriteState {
    buffer: BytesMut,
    chunk_size: usize,
}

/// State shared between the stream handle and the retransmitter task.
pub(crate) struct StreamShared {
    pub(crate) config: ReliableStreamConfig,
    pub(crate) outgoing: Arc<dyn Outgoing>,
    pub(crate) queue: Mutex<QueueState>,
    /// wakes admission-control waiters, shutdown waiters and anyone else watching the queue
    pub(crate) queue_event: Notify,
    write_state: Mutex<WriteState>,
    seq_counter: AtomicU32,
    max_ack: AtomicU32,
    acks_sampled: AtomicU64,
    /// estimate of free space in the peer's input queue; goes negative while sends are
    ///  in flight and is corrected by the next acknowledgement
    pub(crate) remote_free_space: AtomicI64,
    local_closed: AtomicBool,
    remote_closed: AtomicBool,
    linger_millis: AtomicU64,
    /// the single outstanding scheduled retransmission check
    pub(crate) retransmit_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    retransmitter_started: AtomicBool,
}

impl StreamShared {
    pub(crate) fn is_closed(&self) -> bool {
        self.local_closed.load(Ordering::Acquire) || self.remote_closed.load(Ordering::Acquire)
    }

    fn linger_deadline(&self, now: Instant) -> Option<Instant> {
        match self.linger_millis.load(Ordering::Acquire) {
            LINGER_UNBOUNDED => None,
            millis => Some(now + Duration::from_millis(millis)),
        }
    }

    /// The peer will accept no more data (or is unreachable): stop retransmitting, drop
    ///  everything pending, release all waiters. Safe to call repeatedly from any task.
    pub(crate) async fn hard_close(&self) {
        self.remote_closed.store(true, Ordering::Release);

        {
            let mut queue = self.queue.lock().await;
            queue.close_deadline = Some(Instant::now());
            queue.retry_queue.clear();
        }
        self.queue_event.notify_waiters();

        {
            let mut write_state = self.write_state.lock().await;
            write_state.buffer.clear();
        }

        info!("hard closed");
    }
}

/// The sending half of a reliable stream over an unreliable message pipe.
///
/// Bytes written are buffered and cut into chunks; every chunk is assigned a sequence
///  number, kept in a retry queue until the peer acknowledges it, and handed to the
///  [`Outgoing`] channel. Acknowledgements (cumulative plus selective) arrive through
///  [`ReliableSendStream::recv`] and drive removal from the queue, round-trip
///  estimation and flow control. A scheduled retransmitter re-sends whatever stays
///  unacknowledged for longer than the adaptive timeout, and declares the connection
///  dead when the peer stops responding altogether.
///
/// `write`, `close` and `recv` may be called concurrently from any number of tasks.
pub struct ReliableSendStream {
    pub(crate) shared: Arc<StreamShared>,
}

impl Drop for ReliableSendStream {
    fn drop(&mut self) {
        // a pending retransmission check must not outlive the stream handle
        if let Ok(mut slot) = self.shared.retransmit_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

impl ReliableSendStream {
    pub fn new(
        config: ReliableStreamConfig,
        outgoing: Arc<dyn Outgoing>,
        flow_control: Box<dyn FlowControl>,
    ) -> Result<ReliableSendStream> {
        config.validate()?;

        let now = Instant::now();
        let rwindow = flow_control.rwindow();
        let max_retry_age = outgoing.max_retry_age();
        let remote_free_space = config.remote_max_queue_size as i64;
        let linger_millis = if config.linger.is_zero() {
            LINGER_UNBOUNDED
        } else {
            config.linger.as_millis() as u64
        };

        let queue = QueueState {
            retry_queue: RetryQueue::default(),
            rtt: RttEstimator::new(
                config.min_rto,
                max_retry_age,
                config.stabilization_ack_count,
                SeqNum::from_raw(config.remote_max_queue_size as u32),
            ),
            flow_control,
            rwindow,
            iq_tests: 0,
            ave_iq_size: 0,
            last_ack_time: now,
            sack_retrans_time: now,
            close_deadline: None,
            n_at_this_rto: 0,
            n_retransmitted: 0,
            idle_counter: 0,
        };

        let write_state = WriteState {
            buffer: BytesMut::with_capacity(config.chunk_size),
            chunk_size: config.chunk_size,
        };

        Ok(ReliableSendStream {
            shared: Arc::new(StreamShared {
                config,
                outgoing,
                queue: Mutex::new(queue),
                queue_event: Notify::new(),
                write_state: Mutex::new(write_state),
                seq_counter: AtomicU32::new(0),
                max_ack: AtomicU32::new(0),
                acks_sampled: AtomicU64::new(0),
                remote_free_space: AtomicI64::new(remote_free_space),
                local_closed: AtomicBool::new(false),
                remote_closed: AtomicBool::new(false),
                linger_millis: AtomicU64::new(linger_millis),
                retransmit_task: std::sync::Mutex::new(None),
                retransmitter_started: AtomicBool::new(false),
            }),
        })
    }

    /// Creates a stream with the default policy: a fixed flow-control window.
    pub fn with_default_flow_control(
        config: ReliableStreamConfig,
        outgoing: Arc<dyn Outgoing>,
    ) -> Result<ReliableSendStream> {
        ReliableSendStream::new(config, outgoing, Box::new(FixedFlowControl::default()))
    }

    /// Appends bytes to the write buffer, emitting a chunk whenever it fills up. May
    ///  block on admission control while the in-flight window is exhausted.
    pub async fn write(&self, mut buf: &[u8]) -> Result<()> {
        let mut write_state = self.shared.write_state.lock().await;

        if self.shared.is_closed() {
            return Err(Error::StreamClosed);
        }

        while !buf.is_empty() {
            let available = write_state.chunk_size - write_state.buffer.len();
            let copy = min(available, buf.len());
            write_state.buffer.extend_from_slice(&buf[..copy]);
            buf = &buf[copy..];

            if write_state.buffer.len() == write_state.chunk_size {
                self.flush_locked(&mut write_state).await?;
            }
        }

        Ok(())
    }

    /// Forces out a partially filled buffer as one chunk.
    pub async fn flush(&self) -> Result<()> {
        let mut write_state = self.shared.write_state.lock().await;
        self.flush_locked(&mut write_state).await
    }

    async fn flush_locked(&self, write_state: &mut WriteState) -> Result<()> {
        if write_state.buffer.is_empty() {
            return Ok(());
        }

        // the buffer is handed off up front: once emission reaches the retry queue the
        //  chunk lives there, and a failed buffer is not offered for a second write
        let chunk = write_state.buffer.split().freeze();
        self.write_chunk(chunk).await?;
        Ok(())
    }

    /// Serializes a whole message as a single chunk, bypassing the chunk-size
    ///  buffering. Pending buffered bytes are flushed first so ordering with the data
    ///  stream is preserved. Returns the assigned sequence number.
    pub async fn send(&self, msg: &Message) -> Result<SeqNum> {
        let mut serialized = BytesMut::with_capacity(msg.byte_len());
        msg.ser(&mut serialized);

        let mut write_state = self.shared.write_state.lock().await;
        self.flush_locked(&mut write_state).await?;
        self.write_chunk(serialized.freeze()).await
    }

    /// Emits one chunk: waits for admission, assigns the sequence number, enqueues a
    ///  copy for retransmission and hands the message to the channel.
    async fn write_chunk(&self, payload: Bytes) -> Result<SeqNum> {
        let mut queue = self.shared.queue.lock().await;

        loop {
            if self.shared.is_closed() {
                return Err(Error::StreamClosed);
            }

            let window = min(
                queue.rwindow as i64,
                2 * self.shared.remote_free_space.load(Ordering::Acquire),
            );
            if (queue.retry_queue.len() as i64) <= window {
                break;
            }

            trace!("retry queue length {} exceeds window {}, waiting", queue.retry_queue.len(), window);
            drop(queue);
            let notified = self.shared.queue_event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let _ = tokio::time::timeout(ADMISSION_RECHECK_INTERVAL, notified).await;
            queue = self.shared.queue.lock().await;
        }

        let seq_num = SeqNum::from_raw(self.shared.seq_counter.fetch_add(1, Ordering::AcqRel) + 1);

        let payload = self.shared.config.encryption.apply(payload)
            .map_err(Error::Transport)?;

        let mut msg = Message::new();
        msg.add_element(message::NAMESPACE, &seq_num.to_raw().to_string(), payload);

        queue.retry_queue.push(RetryEntry::new(seq_num, msg.clone()));
        debug!("enqueued chunk #{}, retry queue length {}", seq_num, queue.retry_queue.len());

        if !self.shared.retransmitter_started.swap(true, Ordering::AcqRel) {
            info!("starting retransmitter, initial RTO {:?}", queue.rtt.rto());
            Retransmitter::schedule(self.shared.clone(), queue.rtt.rto());
        }

        drop(queue);

        match self.shared.outgoing.send(msg).await {
            Ok(_accepted) => {
                // assume the chunk takes a slot in the peer's queue until feedback arrives
                self.shared.remote_free_space.fetch_sub(1, Ordering::AcqRel);
                trace!("sent chunk #{}", seq_num);
                Ok(seq_num)
            }
            Err(e) => {
                // the chunk stays queued; the retransmitter will pick it up
                debug!("initial send of chunk #{} failed: {}", seq_num, e);
                Err(Error::Transport(e))
            }
        }
    }

    /// Closes the stream locally: flushes buffered bytes, refuses further writes, and
    ///  keeps retransmitting what is already queued until it is acknowledged or the
    ///  linger delay expires.
    pub async fn close(&self) -> Result<()> {
        self.flush().await?;

        self.shared.local_closed.store(true, Ordering::Release);
        {
            let mut queue = self.shared.queue.lock().await;
            queue.close_deadline = self.shared.linger_deadline(Instant::now());
        }
        self.shared.queue_event.notify_waiters();

        if self.shared.retransmitter_started.load(Ordering::Acquire) {
            Retransmitter::schedule_immediate(self.shared.clone());
        }

        info!("closed");
        Ok(())
    }

    /// The peer signalled it will accept no more data: drop everything immediately.
    pub async fn hard_close(&self) {
        self.shared.hard_close().await;
    }

    /// Entry point for protocol messages received from the peer. Extracts all
    ///  acknowledgement elements; a malformed element is logged and skipped without
    ///  affecting the others.
    pub async fn recv(&self, msg: &Message) {
        for element in msg.elements(message::NAMESPACE, message::ACK_ELEMENT_NAME) {
            let mut payload: &[u8] = &element.payload;
            match Acknowledgement::deser(&mut payload) {
                Ok(ack) => self.ack_received(ack).await,
                Err(e) => warn!("failed to decode acknowledgement element: {}", e),
            }
        }
    }

    /// Processes one acknowledgement: removes covered chunks from the retry queue,
    ///  updates the round-trip estimate and the flow-control window, and wakes
    ///  everyone waiting on queue state.
    pub async fn ack_received(&self, ack: Acknowledgement) {
        let Acknowledgement { cumulative, sack_list } = ack;

        let mut queue = self.shared.queue.lock().await;
        let now = Instant::now();
        queue.last_ack_time = now;
        queue.flow_control.ack_event_begin();
        self.shared.max_ack.fetch_max(cumulative.to_raw(), Ordering::AcqRel);

        trace!("ACK #{} with {} selective entries, retry queue length {}", cumulative, sack_list.len(), queue.retry_queue.len());

        // The best round-trip candidate is the largest sample among chunks acknowledged
        //  on their first transmission. A retransmitted chunk only provides a guess (its
        //  age divided by the number of transmissions), kept as a fallback: the ACK may
        //  belong to an earlier transmission, so the sample may be far off.
        let mut primary: Option<(Duration, SeqNum)> = None;
        let mut fallback: Option<(Duration, SeqNum)> = None;

        let removed = queue.retry_queue.remove_cumulative(cumulative);
        for entry in &removed {
            Self::track_rtt_candidate(entry, now, &mut primary, &mut fallback);
            queue.flow_control.packet_acked(entry.seq_num);
        }
        if !removed.is_empty() {
            self.shared.outgoing.set_last_accessed(now);
        }
        debug!("cumulative ACK #{} removed {} chunks", cumulative, removed.len());

        // re-estimate the peer's input queue from the selective list: everything in it
        //  is sitting in that queue right now
        let free_space = self.shared.config.remote_max_queue_size as i64 - sack_list.len() as i64;
        self.shared.remote_free_space.store(free_space, Ordering::Release);
        let n = queue.iq_tests;
        let ave_iq_size = (n * queue.ave_iq_size + sack_list.len() as u64) / (n + 1);
        queue.iq_tests = n + 1;
        queue.ave_iq_size = ave_iq_size;
        debug!("remote queue free space estimate {}, average occupancy {}", free_space, ave_iq_size);

        if !sack_list.is_empty() {
            let (sack_removed, holes) = queue.retry_queue.remove_selective(cumulative, &sack_list);
            for entry in &sack_removed {
                trace!("selectively acknowledged chunk #{}", entry.seq_num);
                Self::track_rtt_candidate(entry, now, &mut primary, &mut fallback);
                queue.flow_control.packet_acked(entry.seq_num);
            }
            for &seq_num in &holes {
                // a hole is flow-control input, not an immediate resend - the
                //  retransmitter owns the timing
                debug!("chunk #{} confirmed missing below the selective-ack ceiling", seq_num);
                queue.flow_control.packet_missing(seq_num);
            }
            debug!("selectively acknowledged {} chunks, {} confirmed holes", sack_removed.len(), holes.len());
        }

        // the fallback sample is only trusted when it would not shrink the average -
        //  an underestimated round trip leads to retransmitting like crazy
        let chosen = match (primary, fallback) {
            (Some(primary), _) => Some(primary),
            (None, Some(fallback)) if fallback.0 > queue.rtt.ave_rtt() => Some(fallback),
            _ => None,
        };
        if let Some((sample, seq_num)) = chosen {
            let ack_count = self.shared.acks_sampled.fetch_add(1, Ordering::AcqRel) + 1;
            let current_seq = SeqNum::from_raw(self.shared.seq_counter.load(Ordering::Acquire));
            queue.rtt.on_ack_sample(sample, seq_num, current_seq, ack_count);

            let ave_rtt = queue.rtt.ave_rtt();
            let rwindow = queue.flow_control.ack_event_end(
                self.shared.config.remote_max_queue_size,
                ave_rtt,
                sample,
            );
            queue.rwindow = rwindow;
        }

        drop(queue);

        self.shared.queue_event.notify_waiters();
        if self.shared.retransmitter_started.load(Ordering::Acquire) {
            Retransmitter::schedule_immediate(self.shared.clone());
        }
    }

    fn track_rtt_candidate(
        entry: &RetryEntry,
        now: Instant,
        primary: &mut Option<(Duration, SeqNum)>,
        fallback: &mut Option<(Duration, SeqNum)>,
    ) {
        let age = now.saturating_duration_since(entry.enqueued_at);
        if entry.marked == 0 {
            if primary.map_or(true, |(best, _)| age > best) {
                *primary = Some((age, entry.seq_num));
            }
        } else {
            let guess = age / (entry.marked + 1);
            if fallback.map_or(true, |(best, _)| guess > best) {
                *fallback = Some((guess, entry.seq_num));
            }
        }
    }

    /// The sequence number most recently assigned.
    pub fn seq_number(&self) -> SeqNum {
        SeqNum::from_raw(self.shared.seq_counter.load(Ordering::Acquire))
    }

    /// The highest cumulative acknowledgement received so far.
    pub fn max_ack(&self) -> SeqNum {
        SeqNum::from_raw(self.shared.max_ack.load(Ordering::Acquire))
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Whether the peer's input queue is estimated to be out of space.
    pub fn is_queue_full(&self) -> bool {
        self.shared.remote_free_space.load(Ordering::Acquire) < 1
    }

    pub async fn is_queue_empty(&self) -> bool {
        self.shared.queue.lock().await.retry_queue.is_empty()
    }

    pub async fn chunk_size(&self) -> usize {
        self.shared.write_state.lock().await.chunk_size
    }

    /// Changes the chunk size for subsequent writes. Pending buffered bytes are
    ///  flushed first so no chunk mixes the two sizes.
    pub async fn set_chunk_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument("chunk size must be positive"));
        }

        let mut write_state = self.shared.write_state.lock().await;
        self.flush_locked(&mut write_state).await?;
        write_state.chunk_size = size;
        Ok(())
    }

    /// The linger delay applied by a later [`ReliableSendStream::close`];
    ///  `Duration::ZERO` means 'indefinitely'.
    pub fn linger(&self) -> Duration {
        match self.shared.linger_millis.load(Ordering::Acquire) {
            LINGER_UNBOUNDED => Duration::ZERO,
            millis => Duration::from_millis(millis),
        }
    }

    pub fn set_linger(&self, linger: Duration) {
        let millis = if linger.is_zero() {
            LINGER_UNBOUNDED
        } else {
            linger.as_millis() as u64
        };
        self.shared.linger_millis.store(millis, Ordering::Release);
    }

    pub async fn retransmit_count(&self) -> u64 {
        self.shared.queue.lock().await.n_retransmitted
    }

    /// Waits until the retry queue is empty, typically as part of an orderly shutdown.
    ///  Returns whether it became empty within the timeout.
    pub async fn wait_queue_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.shared.queue_event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.queue.lock().await.retry_queue.is_empty() {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    /// Waits for any activity on the retry queue: space freed, an acknowledgement
    ///  processed, or the stream closed.
    pub async fn wait_queue_event(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.shared.queue_event.notified()).await;
    }
}
