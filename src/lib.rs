//! The sending half of a reliable byte stream running on top of an unreliable,
//!  message-oriented pipe between two peers. The pipe may drop, delay and reorder
//!  messages arbitrarily; this layer turns it into an ordered, flow-controlled,
//!  retransmitting stream - in effect a user-space TCP sender over an arbitrary
//!  datagram substrate.
//!
//! ## Design goals
//!
//! * The abstraction towards the application is a *byte stream*: write, flush, close.
//!   Everything below - chunking, sequence numbers, retransmission, backoff - is
//!   invisible except as latency.
//! * The abstraction towards the network is a *message envelope* with named elements.
//!   The envelope's wire format, the transports carrying it and the receiving half of
//!   the protocol are all external; this crate only consumes a channel that can
//!   `send` an envelope and report its liveness parameters.
//! * Delivery is acknowledged positively: the receiver acknowledges the highest
//!   sequence number received in order (cumulative ACK), plus everything it holds
//!   beyond that point (selective ACK). Holes below the selective ceiling are the
//!   sender's cue that chunks were lost rather than reordered.
//! * Retransmission timing adapts to the measured round trip and backs off
//!   multiplicatively while the peer stays silent, bounded by a maximum retry age
//!   after which the connection is declared stale and abandoned.
//! * Flow control is pluggable: a policy object observes per-chunk ACK/loss events
//!   and recommends the in-flight window. The default is a fixed window.
//! * Closing is graceful by default: a locally closed stream keeps retransmitting
//!   pending chunks until they are acknowledged or a configurable linger delay
//!   expires. A close initiated by the peer is immediate and drops everything.
//!
//! ## Chunk elements
//!
//! Each chunk travels as a single element in a fresh envelope, in the `rel`
//!  namespace, named by its decimal sequence number. Retransmitted copies
//!  additionally carry a `retry` marker element. If encryption is configured, the
//!  chunk payload is encrypted before it is wrapped.
//!
//! ## Acknowledgement elements
//!
//! Acknowledgements arrive as `ack` elements in the `rel` namespace. The payload is
//!  a run of 32-bit big-endian integers:
//!
//! ```ascii
//! 0: cumulative ACK (u32 BE) - all chunks up to and including this sequence
//!     number have been received
//! 4: (repeated) selectively acknowledged sequence number (u32 BE), sorted
//!     ascending, each greater than the cumulative ACK. The count is inferred
//!     from the element's byte length.
//! ```
//!
//! ## Retransmission timing
//!
//! The retransmission timeout is twice the smoothed average round trip, clamped
//!  between a configured minimum and the channel's maximum retry age. Round-trip
//!  samples are taken from chunks acknowledged on their first transmission; chunks
//!  that were retransmitted only contribute a discounted guess, and only if it would
//!  not shrink the average. A recurring check re-sends up to one flow-control window
//!  of overdue chunks per cycle, doubles the timeout when a full window of
//!  retransmissions has gone unanswered for twice the timeout, and snaps back to the
//!  minimum after two fully idle cycles.

pub mod ack;
pub mod config;
pub mod encryption;
pub mod error;
pub mod flow_control;
pub mod message;
pub mod outgoing;
mod retransmitter;
mod retry_queue;
pub mod rtt;
pub mod send_stream;
pub mod seq_num;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
