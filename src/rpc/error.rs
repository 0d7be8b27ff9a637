use crate::BoxedError;
use thiserror::Error;

/// Error type for issuing requests and hosting responders
#[derive(Error, Debug)]
pub enum RpcError {
    /// The caller's cancellation fired or the configured expiration elapsed
    /// before a response arrived
    #[error("request was cancelled before a response arrived")]
    Cancelled,
    /// The consumer channel was re-established while the request was in
    /// flight, so its reply can no longer be tracked
    #[error("connection was lost while the request was in flight")]
    ConnectionLost,
    /// The responder failed; the round trip itself succeeded
    #[error("responder reported a fault: {0}")]
    ResponderFault(String),
    /// The serialized response type name does not fit the broker's bounded
    /// header fields
    #[error("serialized response type name is {0} bytes, above the 255 byte limit")]
    ResponseNameTooLong(usize),
    /// The broker client failed; the underlying error is preserved unwrapped
    #[error("broker operation failed")]
    Broker(#[source] BoxedError),
    /// A payload could not be serialized or deserialized
    #[error("payload could not be encoded or decoded")]
    Codec(#[from] serde_json::Error),
}
