use miette::Diagnostic;
use thiserror::Error;

use crate::NetworkResponse;

/// A `Result` typedef to use with the [`RequestError`] type
pub type Result<T> = std::result::Result<T, RequestError>;

/// The terminal error of a dispatched request.
///
/// This is a closed set: every failure a listener can observe is one of
/// these kinds. Each variant carries the originating [`NetworkResponse`]
/// when one exists and the elapsed network time stamped by the dispatcher.
#[derive(Error, Diagnostic, Debug)]
pub enum RequestError {
    /// The transport gave up after exhausting the request's retry policy
    #[error("request timed out")]
    #[diagnostic(code(http_dispatch::timeout))]
    Timeout {
        /// Elapsed time on the network, in milliseconds
        network_time_ms: i64,
    },
    /// No usable route to the origin server
    #[error("no usable network connection")]
    #[diagnostic(code(http_dispatch::no_connection))]
    NoConnection {
        /// The underlying connection failure
        #[source]
        source: std::io::Error,
        /// Elapsed time on the network, in milliseconds
        network_time_ms: i64,
    },
    /// The round trip failed below the HTTP layer
    #[error("network I/O failure")]
    #[diagnostic(code(http_dispatch::network))]
    Network {
        /// The partial response, when the failure happened mid-exchange
        response: Option<NetworkResponse>,
        /// The underlying I/O failure
        #[source]
        source: std::io::Error,
        /// Elapsed time on the network, in milliseconds
        network_time_ms: i64,
    },
    /// The server answered with a non-success status
    #[error("server responded with status {}", .response.status)]
    #[diagnostic(code(http_dispatch::server))]
    Server {
        /// The error response as received
        response: NetworkResponse,
        /// Elapsed time on the network, in milliseconds
        network_time_ms: i64,
    },
    /// The server rejected the request's credentials (401 or 403)
    #[error("authentication failure (status {})", .response.status)]
    #[diagnostic(code(http_dispatch::auth))]
    Auth {
        /// The rejection response as received
        response: NetworkResponse,
        /// Elapsed time on the network, in milliseconds
        network_time_ms: i64,
    },
    /// The response body could not be parsed into the requested type
    #[error("failed to parse response: {detail}")]
    #[diagnostic(code(http_dispatch::parse))]
    Parse {
        /// The response that failed to parse, when available
        response: Option<NetworkResponse>,
        /// What went wrong
        detail: String,
        /// Elapsed time on the network, in milliseconds
        network_time_ms: i64,
    },
}

impl RequestError {
    /// Shorthand for a [`RequestError::Parse`] with no attached response.
    ///
    /// Intended for user parser functions.
    pub fn parse(detail: impl Into<String>) -> Self {
        Self::Parse { response: None, detail: detail.into(), network_time_ms: 0 }
    }

    /// The network response this error originated from, if any
    pub fn network_response(&self) -> Option<&NetworkResponse> {
        match self {
            Self::Timeout { .. } | Self::NoConnection { .. } => None,
            Self::Network { response, .. } | Self::Parse { response, .. } => {
                response.as_ref()
            }
            Self::Server { response, .. } | Self::Auth { response, .. } => {
                Some(response)
            }
        }
    }

    /// Elapsed network time when this error surfaced, in milliseconds
    pub fn network_time_ms(&self) -> i64 {
        match self {
            Self::Timeout { network_time_ms }
            | Self::NoConnection { network_time_ms, .. }
            | Self::Network { network_time_ms, .. }
            | Self::Server { network_time_ms, .. }
            | Self::Auth { network_time_ms, .. }
            | Self::Parse { network_time_ms, .. } => *network_time_ms,
        }
    }

    /// Returns this error with its network-time stamp replaced
    pub fn with_network_time_ms(mut self, elapsed_ms: i64) -> Self {
        match &mut self {
            Self::Timeout { network_time_ms }
            | Self::NoConnection { network_time_ms, .. }
            | Self::Network { network_time_ms, .. }
            | Self::Server { network_time_ms, .. }
            | Self::Auth { network_time_ms, .. }
            | Self::Parse { network_time_ms, .. } => {
                *network_time_ms = elapsed_ms;
            }
        }
        self
    }

    /// The HTTP status of the originating response, if any
    pub fn status(&self) -> Option<u16> {
        self.network_response().map(|response| response.status)
    }
}
