use thiserror::Error;

/// Failures the executor reports or acts on by kind. Handler failures are
/// deliberately absent: a failing handler is a normal Failed outcome carried
/// through the callback path, not an executor error.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// A trigger referenced a handler name nobody registered. Rejected
    /// synchronously, before any worker state exists.
    #[error("unknown job handler '{0}'")]
    UnknownHandler(String),

    /// An outbound admin call did not get through (transport failure or an
    /// undecodable response). Transient: callers fall back to the disk retry
    /// log or the next tick.
    #[error("delivery to {address} failed: {reason}")]
    Delivery { address: String, reason: String },

    /// The admin answered with a failure code. Retried the same way as a
    /// transport failure.
    #[error("admin {address} rejected the call with code {code}: {msg}")]
    AdminRejected {
        address: String,
        code: i32,
        msg: String,
    },

    /// Every configured admin endpoint refused a broadcast. Logged by the
    /// owning loop; never fatal.
    #[error("all admin endpoints unreachable")]
    RegistryUnavailable,

    /// Rejected at startup, before anything runs.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
