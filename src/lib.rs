//! WebSocket client and server for the [`monoio`](https://github.com/bytedance/monoio) runtime.
//!
//! The crate is layered:
//!
//! - [`handshake`] negotiates the HTTP upgrade on any stream, for either role.
//! - [`protocol::frame`] encodes and decodes RFC 6455 frames.
//! - [`Session`] drives one connection: it answers pings, reassembles
//!   messages for a [`Handler`], serializes writers and tears down once.
//! - [`Registry`] tracks the sessions of a server and broadcasts to them.
//!
//! [`Server`] and [`Client`] wire these together over TCP.

#![deny(
    missing_docs,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]

pub mod error;
pub use error::{Error, Result};

pub mod protocol;

mod registry;
pub use registry::Registry;

#[cfg(feature = "handshake")]
pub mod client;
#[cfg(feature = "handshake")]
pub mod handshake;
#[cfg(feature = "handshake")]
pub mod server;

mod framed;

// re-export bytes since used in `Message` API.
pub use bytes::Bytes;
#[cfg(feature = "handshake")]
pub use http;

pub use crate::protocol::{
    CloseFrame, FrameReader, Handler, Message, Role, Session, SessionState, WebSocketConfig,
    frame::Utf8Bytes,
};
#[cfg(feature = "handshake")]
pub use crate::{
    client::{Client, ClientRequestBuilder, Connection, IntoClientRequest, client},
    handshake::{Upgraded, client::client_handshake, server::server_handshake},
    server::{Server, accept, accept_hdr, accept_hdr_with_config, accept_with_config},
};
