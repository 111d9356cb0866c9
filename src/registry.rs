//! The server-side set of live sessions.

use std::{fmt, rc::Rc};

use futures::lock::Mutex;
use monoio::io::AsyncWriteRent;
use tracing::{debug, warn};

use crate::protocol::{CloseFrame, Message, Session};

/// Shared handle to the sessions currently connected to a server.
///
/// Cloning the handle is cheap and every clone sees the same set. All
/// operations take the same lock, so a broadcast never observes a half-applied
/// join or leave, and membership changes wait for a running broadcast.
pub struct Registry<W> {
    sessions: Rc<Mutex<Vec<Rc<Session<W>>>>>,
}

impl<W> Clone for Registry<W> {
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
        }
    }
}

impl<W> Default for Registry<W> {
    fn default() -> Self {
        Self {
            sessions: Rc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<W> fmt::Debug for Registry<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").finish_non_exhaustive()
    }
}

impl<W> Registry<W> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a session. Registering the same session twice has no effect.
    pub async fn register(&self, session: Rc<Session<W>>) {
        let mut sessions = self.sessions.lock().await;
        if !sessions.iter().any(|s| Rc::ptr_eq(s, &session)) {
            debug!(session = session.id(), "session registered");
            sessions.push(session);
        }
    }

    /// Removes a session. Returns whether it was registered.
    pub async fn unregister(&self, session: &Session<W>) -> bool {
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|s| s.id() != session.id());
        let removed = sessions.len() != before;
        if removed {
            debug!(session = session.id(), "session unregistered");
        }
        removed
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Tells whether no session is registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// A snapshot of the registered sessions.
    pub async fn sessions(&self) -> Vec<Rc<Session<W>>> {
        self.sessions.lock().await.clone()
    }
}

impl<W> Registry<W>
where
    W: AsyncWriteRent,
{
    /// Sends `message` to every registered session, in registration order.
    ///
    /// A session whose send fails is logged and unregistered, and its read loop
    /// winds down; the remaining sessions still receive the message. Returns
    /// the number of successful deliveries.
    pub async fn broadcast(&self, message: impl Into<Message>) -> usize {
        let message = message.into();
        let mut sessions = self.sessions.lock().await;

        let mut delivered = 0;
        let mut i = 0;
        while i < sessions.len() {
            match sessions[i].send(message.clone()).await {
                Ok(()) => {
                    delivered += 1;
                    i += 1;
                }
                Err(err) => {
                    let session = sessions.remove(i);
                    warn!(session = session.id(), error = %err, "broadcast failed, unregistering");
                }
            }
        }
        delivered
    }

    /// Starts the closing handshake on every registered session.
    ///
    /// Sessions stay registered until their read loops finish.
    pub async fn close_all(&self, frame: Option<CloseFrame>) {
        for session in self.sessions().await {
            if let Err(err) = session.close(frame.clone()).await {
                debug!(session = session.id(), error = %err, "close failed");
            }
        }
    }
}
