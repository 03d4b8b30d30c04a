use crate::engine::HandshakeStatus;

/// Top-level crate error.
///
/// Errors never cross a record-pump boundary by unwinding: pumps branch on
/// the variant and translate it into RESET/ABORT messages on the proper
/// streams.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Message shorter than its framing requires.
    #[error("truncated message: need {needed} bytes")]
    Truncated { needed: usize },
    /// Message type id not one of the seven stream message kinds.
    #[error("unknown message type {0:#06x}")]
    UnknownType(u32),
    /// A length-prefixed string field is not valid UTF-8 or overruns the body.
    #[error("malformed string field")]
    MalformedString,
    /// TLS library failure (handshake alert, bad record, bad certificate).
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    /// Operation not legal for the engine's current handshake state.
    #[error("engine in {0:?}, operation not permitted")]
    EngineState(HandshakeStatus),
    /// Store context could not be loaded for a route registration.
    #[error("store {name:?}: {reason}")]
    StoreLoad { name: Option<String>, reason: String },
    /// More than 256 distinct trust stores registered.
    #[error("store index space exhausted")]
    StoreIndexExhausted,
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}
