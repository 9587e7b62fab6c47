/// Errors that abort a run, or that guard against misuse of the building blocks.
///
/// Failures of individual requests are not errors in this sense. They are recorded as an
/// [`Outcome`](crate::executor::Outcome) on the request's result and the run carries on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The HTTP client backing the session could not be constructed.
    #[error("failed to open client session: {0}")]
    Session(#[from] reqwest::Error),
    /// A blocking worker used to set up or tear down the session did not finish.
    #[error("session worker failed: {0}")]
    SessionWorker(#[from] tokio::task::JoinError),
    /// The signer did not produce a usable `Authorization` header.
    #[error("failed to sign request for `{uri}`: {reason}")]
    SigningFailed {
        /// The URI of the request that could not be signed.
        uri: String,
        /// Why signing failed.
        reason: String,
    },
    /// The payload checksum was requested before a payload was created.
    #[error("payload has not been created yet")]
    NotInitialized,
    /// A payload of a different size than the cached one was requested.
    #[error("payload already created with {cached} bytes, cannot create {requested} bytes")]
    PayloadSizeMismatch {
        /// Size of the payload created first.
        cached: usize,
        /// Size of the conflicting request.
        requested: usize,
    },
    /// An operation was invoked in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// A summary was requested, but not a single request succeeded.
    #[error(
        "no successful requests ({transport_failed} transport failures, \
         {integrity_failed} integrity failures, {not_started} not started)"
    )]
    NoSamples {
        /// Requests that failed on the network or with an unexpected status.
        transport_failed: u64,
        /// Requests whose integrity token did not match the payload.
        integrity_failed: u64,
        /// Requests that were never released because the run was cancelled.
        not_started: u64,
    },
    /// The run parameters are out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A convenience alias that defaults our [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
