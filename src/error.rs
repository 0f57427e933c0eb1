use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to users of a reliable send stream. Loss, retransmission and
///  backoff are handled internally and never show up here - what remains are
///  misuse of the API and the two conditions the stream cannot recover from.
#[derive(Error, Debug)]
pub enum Error {
    /// The stream was closed, either locally or by the peer. Writes and sends
    ///  fail with this error once close is initiated.
    #[error("stream is closed")]
    StreamClosed,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The underlying channel failed while handing off a chunk. The chunk stays
    ///  in the retry queue, so this is only reported for the initial transmission
    ///  attempt - retransmission failures are absorbed by the retransmit cycle.
    #[error("transport failure: {0}")]
    Transport(anyhow::Error),
}
