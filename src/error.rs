//! Error handling.

use std::{io, result};

#[cfg(feature = "handshake")]
use http::{HeaderName, Response};
use thiserror::Error;

use crate::protocol::frame::coding::Data;

/// Result type of all WebSocket library calls.
pub type Result<T, E = Error> = result::Result<T, E>;

/// Possible WebSocket errors.
#[derive(Error, Debug)]
pub enum Error {
    /// The closing handshake finished and the connection is gone.
    ///
    /// This is not an error in most cases; it is returned once the peer and
    /// we have exchanged close frames or the stream was shut down afterwards.
    #[error("Connection closed normally")]
    ConnectionClosed,
    /// Trying to work with an already released session.
    ///
    /// Returned by [`Session::send`](crate::Session::send) and friends after the
    /// read loop has torn the connection down.
    #[error("Trying to work with closed connection")]
    AlreadyClosed,
    /// The remote host could not be reached.
    #[cfg(feature = "handshake")]
    #[error("Dial error: {0}")]
    Dial(#[source] io::Error),
    /// Input-output error on an established stream.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Buffer capacity exhausted.
    #[error("Space limit exceeded: {0}")]
    Capacity(#[from] CapacityError),
    /// The peer violated the framing rules.
    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// The opening handshake was malformed or rejected.
    #[cfg(feature = "handshake")]
    #[error("WebSocket handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    /// UTF coding error.
    #[error("UTF-8 encoding error: {0}")]
    Utf8(String),
    /// Invalid URL.
    #[cfg(feature = "handshake")]
    #[error("URL error: {0}")]
    Url(#[from] UrlError),
    /// The peer answered the upgrade with something other than `101 Switching Protocols`.
    #[cfg(feature = "handshake")]
    #[error("HTTP error: {}", .0.status())]
    Http(Box<Response<Option<Vec<u8>>>>),
    /// HTTP format error.
    #[cfg(feature = "handshake")]
    #[error("HTTP format error: {0}")]
    HttpFormat(#[from] http::Error),
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::Utf8(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Utf8(err.to_string())
    }
}

impl From<simdutf8::basic::Utf8Error> for Error {
    fn from(err: simdutf8::basic::Utf8Error) -> Self {
        Error::Utf8(err.to_string())
    }
}

#[cfg(feature = "handshake")]
impl From<http::header::InvalidHeaderValue> for Error {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        Error::HttpFormat(err.into())
    }
}

#[cfg(feature = "handshake")]
impl From<http::header::InvalidHeaderName> for Error {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        Error::HttpFormat(err.into())
    }
}

#[cfg(feature = "handshake")]
impl From<http::header::ToStrError> for Error {
    fn from(_: http::header::ToStrError) -> Self {
        Error::Utf8("header value is not valid UTF-8".into())
    }
}

#[cfg(feature = "handshake")]
impl From<http::uri::InvalidUri> for Error {
    fn from(err: http::uri::InvalidUri) -> Self {
        Error::HttpFormat(err.into())
    }
}

#[cfg(feature = "handshake")]
impl From<http::status::InvalidStatusCode> for Error {
    fn from(err: http::status::InvalidStatusCode) -> Self {
        Error::HttpFormat(err.into())
    }
}

#[cfg(feature = "handshake")]
impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        match err {
            httparse::Error::TooManyHeaders => Error::Capacity(CapacityError::TooManyHeaders),
            e => Error::Handshake(HandshakeError::Httparse(e)),
        }
    }
}

/// Indicates the specific type/cause of a capacity error.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum CapacityError {
    /// Too many headers provided (see [`httparse::Error::TooManyHeaders`]).
    #[error("Too many headers")]
    TooManyHeaders,
    /// Received header is too long.
    #[error("Message too long: {size} > {max_size}")]
    MessageTooLong {
        /// The size of the message.
        size: usize,
        /// The maximum allowed message size.
        max_size: usize,
    },
}

/// Indicates the specific type/cause of a protocol error.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum ProtocolError {
    /// A server received a frame without the mask bit set.
    #[error("Received an unmasked frame from client")]
    UnmaskedFrameFromClient,
    /// A client received a frame with the mask bit set.
    #[error("Received a masked frame from server")]
    MaskedFrameFromServer,
    /// Reserved bits in frame header are non-zero.
    #[error("Reserved bits are non-zero")]
    NonZeroReservedBits,
    /// Control frames must not be fragmented.
    #[error("Fragmented control frame")]
    FragmentedControlFrame,
    /// Control frames must have a payload of 125 bytes or less.
    #[error("Control frame too big (payload must be 125 bytes or less)")]
    ControlFrameTooBig,
    /// Type of control frame not recognised.
    #[error("Unknown control frame type: {0}")]
    UnknownControlFrameType(u8),
    /// Type of data frame not recognised.
    #[error("Unknown data frame type: {0}")]
    UnknownDataFrameType(u8),
    /// Received a continue frame despite there being nothing to continue.
    #[error("Continue frame but nothing to continue")]
    UnexpectedContinueFrame,
    /// Received data while waiting for more fragments.
    #[error("While waiting for more fragments received: {0}")]
    ExpectedFragment(Data),
    /// The payload for the closing frame is invalid.
    #[error("Invalid close sequence")]
    InvalidCloseSequence,
    /// Connection closed without performing the closing handshake.
    #[error("Connection reset without closing handshake")]
    ResetWithoutClosingHandshake,
    /// Not allowed to send after having sent a closing frame.
    #[error("Sending after closing is not allowed")]
    SendAfterClosing,
}

/// Indicates the specific type/cause of a failed opening handshake.
#[cfg(feature = "handshake")]
#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum HandshakeError {
    /// Use of the wrong HTTP method (the WebSocket protocol requires the GET method be used).
    #[error("Unsupported HTTP method used - only GET is allowed")]
    WrongHttpMethod,
    /// Wrong HTTP version used (the WebSocket protocol requires version 1.1 or higher).
    #[error("HTTP version must be 1.1 or higher")]
    WrongHttpVersion,
    /// Missing `Connection: upgrade` HTTP header.
    #[error("No \"Connection: upgrade\" header")]
    MissingConnectionUpgradeHeader,
    /// Missing `Upgrade: websocket` HTTP header.
    #[error("No \"Upgrade: websocket\" header")]
    MissingUpgradeWebSocketHeader,
    /// Missing `Sec-WebSocket-Version: 13` HTTP header.
    #[error("No \"Sec-WebSocket-Version: 13\" header")]
    MissingSecWebSocketVersionHeader,
    /// Missing `Sec-WebSocket-Key` HTTP header.
    #[error("No \"Sec-WebSocket-Key\" header")]
    MissingSecWebSocketKey,
    /// The `Sec-WebSocket-Accept` header is either not present or does not specify the correct key value.
    #[error("Key mismatch in \"Sec-WebSocket-Accept\" header")]
    SecWebSocketAcceptKeyMismatch,
    /// The request is missing a header or duplicates one the negotiator writes itself.
    #[error("Missing, duplicated or incorrect header {0}")]
    InvalidHeader(HeaderName),
    /// The stream ended before the HTTP head was complete.
    #[error("Handshake not finished")]
    HandshakeIncomplete,
    /// Garbage data encountered after the client request.
    #[error("Junk after client request")]
    JunkAfterRequest,
    /// Custom responses must be unsuccessful.
    #[error("Custom response must not be successful")]
    CustomResponseSuccessful,
    /// The HTTP head could not be parsed.
    #[error("httparse error: {0}")]
    Httparse(httparse::Error),
}

/// Indicates the specific type/cause of URL error.
#[cfg(feature = "handshake")]
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum UrlError {
    /// TLS schemes (`wss://`, `https://`) are not supported.
    #[error("TLS is not supported, use a ws:// URL")]
    TlsUnsupported,
    /// The URL does not include a host name.
    #[error("No host name in the URL")]
    NoHostName,
    /// Unsupported URL scheme used (only `ws://`/`http://` are allowed).
    #[error("URL scheme not supported")]
    UnsupportedUrlScheme,
    /// The URL host name, though included, is empty.
    #[error("URL contains empty host name")]
    EmptyHostName,
    /// The URL does not include a path/query.
    #[error("No path/query in URL")]
    NoPathOrQuery,
}

#[cfg(all(test, feature = "handshake"))]
mod tests {
    use super::*;

    #[test]
    fn too_many_headers_is_a_capacity_error() {
        let err = Error::from(httparse::Error::TooManyHeaders);
        assert!(matches!(
            err,
            Error::Capacity(CapacityError::TooManyHeaders)
        ));
    }
}
