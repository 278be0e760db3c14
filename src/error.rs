use thiserror::Error;

/// Failure modes of a single login exchange. One failed exchange aborts only that attempt; the
///  login listener keeps accepting. Errors raised by user-supplied hooks are not represented
///  here - they are caught and logged where the hook is invoked and never fail the exchange.
#[derive(Debug, Error)]
pub enum LoginError {
    /// The client's HTTP request (or the upstream response) was malformed: missing or
    ///  truncated body, unreadable framing.
    #[error("malformed login exchange: {0}")]
    Framing(String),

    /// The upstream login server could not be reached or the connection broke mid-exchange.
    #[error("login transport failure: {0}")]
    Transport(#[from] std::io::Error),

    /// The upstream round trip did not complete within the login timeout.
    #[error("login exchange timed out")]
    Timeout,
}
