use std::time::Duration;

use crate::encryption::SendEncryption;
use crate::error::{Error, Result};

/// Configuration of a reliable send stream.
pub struct ReliableStreamConfig {
    /// The size of the chunks the byte stream is cut into. Writes accumulate in a
    ///  buffer of this size and are emitted as one chunk when it fills up (or on
    ///  flush). This should stay below whatever message size the underlying pipe
    ///  supports comfortably.
    pub chunk_size: usize,

    /// How long a locally closed stream keeps retransmitting unacknowledged chunks
    ///  before giving up on them. `Duration::ZERO` means 'indefinitely'.
    pub linger: Duration,

    /// Lower bound for the retransmission timeout. A reasonable value for an average
    ///  network; it is never used if the measured round trip is greater.
    pub min_rto: Duration,

    /// Number of sampled acknowledgements after which the retransmission timeout may
    ///  only grow, never shrink. Avoids oscillation once the connection's latency
    ///  profile is established. 0 disables the rule.
    pub stabilization_ack_count: u64,

    /// Our assumption about the capacity of the peer's input queue, in chunks. The
    ///  estimate of remaining free space is derived from this and from the length of
    ///  the selective-acknowledgement lists the peer sends.
    pub remote_max_queue_size: usize,

    /// Whether chunk payloads are encrypted before being wrapped into the envelope.
    pub encryption: SendEncryption,
}

impl ReliableStreamConfig {
    pub const DEFAULT_CHUNK_SIZE: usize = 63 * 1024;

    pub fn default_plain() -> ReliableStreamConfig {
        ReliableStreamConfig {
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            linger: Duration::from_secs(120),
            min_rto: Duration::from_millis(500),
            stabilization_ack_count: 0,
            remote_max_queue_size: 50,
            encryption: SendEncryption::Plain,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidArgument("chunk size must be positive"));
        }
        if self.remote_max_queue_size == 0 {
            return Err(Error::InvalidArgument("remote queue size assumption must be positive"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    fn test_validate() {
        assert!(ReliableStreamConfig::default_plain().validate().is_ok());

        let mut config = ReliableStreamConfig::default_plain();
        config.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = ReliableStreamConfig::default_plain();
        config.remote_max_queue_size = 0;
        assert!(config.validate().is_err());
    }
}
