//! Keeps a [crate::DataStore] in sync with the streaming service.
//!
//! The service sends a `put` event with the complete data set whenever a connection is opened,
//! followed by `patch` and `delete` events for individual items. The [StreamProcessor] applies
//! them in arrival order and reconnects with backoff when the connection fails.

mod backoff;
mod event_source;
mod processor;

use thiserror::Error;

use crate::codec::CodecError;

pub use event_source::{EventSource, EventStream, HttpEventSource, SseEvent};
pub use processor::{
    DataSourceError, DataSourceState, DataSourceStatus, StreamHandle, StreamProcessor,
};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("invalid stream URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
    #[error("connection failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("no response received within the read timeout")]
    ConnectTimeout,
    #[error("no data received within the read timeout")]
    ReadTimeout,
    #[error("stream closed by the server")]
    Eof,
    #[error("malformed stream data: {0}")]
    InvalidData(#[from] CodecError),
}

impl StreamError {
    /// Whether the synchronizer should reconnect after this error. Authentication and other
    /// client errors are permanent; everything else is worth retrying.
    pub fn is_recoverable(&self) -> bool {
        match self {
            StreamError::HttpStatus(status) => is_http_error_recoverable(*status),
            StreamError::InvalidUrl(_) => false,
            _ => true,
        }
    }

    /// The HTTP status that caused the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            StreamError::HttpStatus(status) => Some(*status),
            StreamError::Transport(e) => e.status().map(|status| status.as_u16()),
            _ => None,
        }
    }
}

/// Returns true for HTTP statuses that may succeed on a later attempt.
pub fn is_http_error_recoverable(status: u16) -> bool {
    if (400..500).contains(&status) {
        matches!(status, 400 | 408 | 429)
    } else {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(400, true)]
    #[test_case(401, false)]
    #[test_case(403, false)]
    #[test_case(404, false)]
    #[test_case(405, false)]
    #[test_case(408, true)]
    #[test_case(429, true)]
    #[test_case(500, true)]
    #[test_case(503, true)]
    fn classifies_http_statuses(status: u16, recoverable: bool) {
        assert_eq!(recoverable, is_http_error_recoverable(status));
        assert_eq!(recoverable, StreamError::HttpStatus(status).is_recoverable());
        assert_eq!(Some(status), StreamError::HttpStatus(status).status_code());
    }

    #[test]
    fn transient_failures_are_recoverable() {
        assert!(StreamError::ReadTimeout.is_recoverable());
        assert!(StreamError::Eof.is_recoverable());

        let codec_error = crate::codec::parse_event("put", "{").unwrap_err();
        assert!(StreamError::from(codec_error).is_recoverable());
    }

    #[test]
    fn bad_url_is_permanent() {
        let err = StreamError::from(url::Url::parse("not a url").unwrap_err());
        assert!(!err.is_recoverable());
        assert_eq!(None, err.status_code());
    }
}
