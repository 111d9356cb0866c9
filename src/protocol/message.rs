use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::{
    error::{CapacityError, Error, Result},
    protocol::frame::Utf8Bytes,
};

/// A message being reassembled from a sequence of fragments.
#[derive(Debug)]
pub struct IncompleteMessage {
    kind: IncompleteMessageType,
    data: BytesMut,
}

impl IncompleteMessage {
    /// Starts collecting a message of the given kind.
    pub fn new(kind: IncompleteMessageType) -> Self {
        Self {
            kind,
            data: BytesMut::new(),
        }
    }

    /// Bytes collected so far.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Appends a fragment, failing once the total would exceed `size_limit`.
    pub fn extend<T: AsRef<[u8]>>(&mut self, fragment: T, size_limit: Option<usize>) -> Result<()> {
        let fragment = fragment.as_ref();
        let max_size = size_limit.unwrap_or(usize::MAX);
        match self.len().checked_add(fragment.len()) {
            Some(size) if size <= max_size => {
                self.data.extend_from_slice(fragment);
                Ok(())
            }
            size => Err(Error::Capacity(CapacityError::MessageTooLong {
                size: size.unwrap_or(usize::MAX),
                max_size,
            })),
        }
    }

    /// Converts an incomplete message into a complete one.
    ///
    /// Text is validated here, once the whole message is known, so a code point
    /// split across two fragments is not mistaken for invalid input.
    pub fn complete(self) -> Result<Message> {
        let data = self.data.freeze();
        match self.kind {
            IncompleteMessageType::Binary => Ok(Message::Binary(data)),
            IncompleteMessageType::Text => Ok(Message::Text(data.try_into()?)),
        }
    }
}

/// Kind of a message, fixed by its first fragment.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum IncompleteMessageType {
    /// Started by a text frame.
    Text,
    /// Started by a binary frame.
    Binary,
}

/// An application-level WebSocket message.
///
/// Control frames never surface as messages: pings are answered by the
/// session itself and close frames end the read loop.
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Message {
    /// UTF-8 payload of a text message.
    Text(Utf8Bytes),
    /// Opaque payload of a binary message.
    Binary(Bytes),
}

impl Message {
    /// Builds a text message.
    pub fn text(text: impl Into<Utf8Bytes>) -> Self {
        Self::Text(text.into())
    }

    /// Builds a binary message.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::Binary(payload.into())
    }

    /// Whether this is [`Message::Text`].
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// Whether this is [`Message::Binary`].
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// The raw payload, whatever the kind.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(payload) => &payload[..],
        }
    }

    /// Takes the payload out of the message.
    pub fn into_data(self) -> Bytes {
        match self {
            Self::Text(text) => text.into(),
            Self::Binary(payload) => payload,
        }
    }

    /// Takes the payload out as text, validating binary payloads.
    pub fn into_text(self) -> Result<Utf8Bytes> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Binary(payload) => Ok(payload.try_into()?),
        }
    }

    /// Borrows the payload as text, validating binary payloads.
    pub fn to_text(&self) -> Result<&str> {
        match self {
            Self::Text(text) => Ok(text.as_str()),
            Self::Binary(payload) => Ok(simdutf8::basic::from_utf8(payload)?),
        }
    }
}

macro_rules! message_from {
    ($($ty:ty => $ctor:ident),* $(,)?) => {
        $(
            impl From<$ty> for Message {
                #[inline]
                fn from(value: $ty) -> Self {
                    Message::$ctor(value)
                }
            }
        )*
    };
}

message_from! {
    String => text,
    Utf8Bytes => text,
    Bytes => binary,
    Vec<u8> => binary,
}

impl<'a> From<&'a str> for Message {
    #[inline]
    fn from(text: &'a str) -> Self {
        Message::Text(text.into())
    }
}

impl<'a> From<&'a [u8]> for Message {
    #[inline]
    fn from(payload: &'a [u8]) -> Self {
        Message::Binary(Bytes::copy_from_slice(payload))
    }
}

impl From<Message> for Bytes {
    #[inline]
    fn from(message: Message) -> Self {
        message.into_data()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Ok(text) => f.write_str(text),
            Err(_) => write!(f, "Binary Data<length={}>", self.len()),
        }
    }
}
