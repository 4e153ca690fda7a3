//! Errors reported by the Web Risk client.

use std::fmt;

//----------- Error ------------------------------------------------------------

/// An error from the Web Risk client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// The client configuration is invalid.
    InvalidConfig(String),

    /// A URL could not be canonicalized into a lookup expression.
    InvalidUrl(String),

    /// The local database has not been refreshed within twice the update
    /// period.
    ///
    /// Lookups still run against the stale snapshot; this error is returned
    /// alongside their best-effort results.
    DatabaseStale,

    /// A threat list failed its checksum validation.
    ///
    /// Lookups fail until the next successful reset update.
    DatabaseCorrupt,

    /// A transport or remote error from the Web Risk service.
    ApiTransport(String),

    /// The client has been closed.
    Closed,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(reason) => {
                write!(f, "invalid configuration: {reason}")
            }
            Self::InvalidUrl(reason) => write!(f, "invalid URL: {reason}"),
            Self::DatabaseStale => {
                f.write_str("the local threat database is stale")
            }
            Self::DatabaseCorrupt => {
                f.write_str("the local threat database is corrupt")
            }
            Self::ApiTransport(reason) => {
                write!(f, "Web Risk API error: {reason}")
            }
            Self::Closed => f.write_str("the client has been closed"),
        }
    }
}
