//! WebSocket protocol implementation.

use std::time::Duration;

pub mod frame;

mod message;

pub use frame::CloseFrame;
pub use message::Message;

mod session;
pub use session::{FrameReader, Handler, Session, SessionState};

/// Indicates a Client or Server role of the websocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// This socket is a server.
    Server,
    /// This socket is a client.
    Client,
}

/// The configuration for WebSocket connection.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct WebSocketConfig {
    /// The initial capacity of the read buffer. This buffer is pre-allocated and can hold at least
    /// the specified number of bytes without requiring reallocation.
    ///
    /// The default value is 8 KiB.
    pub initial_read_capacity: usize,
    /// The maximum size of an incoming message. `None` means no size limit.
    ///
    /// The default value is 64 MiB, which should be reasonably big for all normal use-cases but
    /// small enough to prevent memory eating by a malicious user.
    pub max_message_size: Option<usize>,
    /// The maximum size of a single incoming message frame.
    ///
    ///  `None` means no size limit. The limit is for frame payload NOT including the frame header.
    ///
    /// The default value is 16 MiB.
    pub max_frame_size: Option<usize>,
    /// When set to `true`, the server will accept and handle unmasked frames
    /// from the client.
    ///
    /// According to the RFC 6455, the server must close the connection to the client in such
    /// cases, however it seems like there are some popular libraries that are sending unmasked
    /// frames, ignoring the RFC. By default this option is set to `false`, i.e. according to
    /// RFC 6455.
    pub accept_unmasked_frames: bool,
    /// Deadline for every read from the stream, handshake included. `None` waits forever.
    ///
    /// Requires a runtime with the timer enabled.
    pub read_timeout: Option<Duration>,
    /// Deadline for writing one frame. `None` waits forever.
    ///
    /// Requires a runtime with the timer enabled.
    pub write_timeout: Option<Duration>,
    /// How long a session that sent a close frame waits for the peer's reply
    /// before dropping the connection. `None` waits forever.
    ///
    /// The default value is 5 seconds. Requires a runtime with the timer enabled.
    pub close_timeout: Option<Duration>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            initial_read_capacity: 8 * 1024,
            max_message_size: Some(64 << 20),
            max_frame_size: Some(16 << 20),
            accept_unmasked_frames: false,
            read_timeout: None,
            write_timeout: None,
            close_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl WebSocketConfig {
    /// Sets [`Self::initial_read_capacity`].
    pub fn initial_read_capacity(mut self, initial_read_capacity: usize) -> Self {
        self.initial_read_capacity = initial_read_capacity;
        self
    }

    /// Sets [`Self::max_message_size`].
    pub fn max_message_size(mut self, max_message_size: Option<usize>) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Sets [`Self::max_frame_size`].
    pub fn max_frame_size(mut self, max_frame_size: Option<usize>) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Sets [`Self::accept_unmasked_frames`].
    pub fn accept_unmasked_frames(mut self, accept_unmasked_frames: bool) -> Self {
        self.accept_unmasked_frames = accept_unmasked_frames;
        self
    }

    /// Sets [`Self::read_timeout`].
    pub fn read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Sets [`Self::write_timeout`].
    pub fn write_timeout(mut self, write_timeout: Option<Duration>) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Sets [`Self::close_timeout`].
    pub fn close_timeout(mut self, close_timeout: Option<Duration>) -> Self {
        self.close_timeout = close_timeout;
        self
    }
}

/// Runs `fut` under an optional deadline, reporting expiry as [`std::io::ErrorKind::TimedOut`].
pub(crate) async fn with_deadline<T, E>(
    deadline: Option<Duration>,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, E>
where
    E: From<std::io::Error>,
{
    match deadline {
        None => fut.await,
        Some(duration) => match monoio::time::timeout(duration, fut).await {
            Ok(res) => res,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "websocket stream deadline expired",
            )
            .into()),
        },
    }
}
