//! WebSocket handshake control.
//!
//! Both negotiators run over any [`AsyncReadRent`](monoio::io::AsyncReadRent) +
//! [`AsyncWriteRent`](monoio::io::AsyncWriteRent) stream and hand it back as an
//! [`Upgraded`] once the peer is authenticated. Nothing is left of the HTTP
//! layer afterwards: the stream is moved out of the negotiator.

pub mod client;
pub mod headers;
pub mod server;

use bytes::BytesMut;
use sha1::{Digest, Sha1};

/// A stream that completed the opening handshake.
///
/// `read_buf` holds bytes the peer sent right after its HTTP head (often the
/// first frames), which must be decoded before reading from `io` again.
#[derive(Debug)]
pub struct Upgraded<S> {
    /// The raw stream, now speaking the WebSocket framing.
    pub io: S,
    /// Bytes already read past the end of the handshake.
    pub read_buf: BytesMut,
}

/// Derives the `Sec-WebSocket-Accept` response header from a `Sec-WebSocket-Key` request header.
///
/// This function can be used to perform a handshake before passing a raw TCP stream to
/// [`Session::from_raw_parts`][crate::Session::from_raw_parts].
pub fn derive_accept_key(request_key: &[u8]) -> String {
    // ... field is constructed by concatenating /key/ ...
    // ... with the string "258EAFA5-E914-47DA-95CA-C5AB0DC85B11" (RFC 6455)
    const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
    let mut sha1 = Sha1::default();
    sha1.update(request_key);
    sha1.update(WS_GUID);
    data_encoding::BASE64.encode(&sha1.finalize())
}
