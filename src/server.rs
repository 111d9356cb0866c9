//! Methods to accept incoming WebSocket connections on a server.

use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs},
    rc::Rc,
};

use monoio::{
    io::{AsyncReadRent, AsyncWriteRent, OwnedWriteHalf},
    net::{TcpListener, TcpStream},
};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    handshake::{
        Upgraded,
        server::{Callback, NoCallback, PathCallback, server_handshake},
    },
    protocol::{Handler, Message, Role, Session, WebSocketConfig},
    registry::Registry,
};

/// Write half of a session accepted by [`Server`].
pub type ServerStream = OwnedWriteHalf<TcpStream>;

/// Accepts a new WebSocket connection with the provided stream.
///
/// This is typically used after a socket has been accepted from a
/// `TcpListener`. That socket is then passed to this function to perform
/// the server half of the accepting a client's websocket connection.
pub async fn accept<S>(stream: S) -> Result<Upgraded<S>>
where
    S: AsyncReadRent + AsyncWriteRent,
{
    accept_with_config(stream, None).await
}

/// The same as [`accept`] but the one can specify a websocket configuration.
pub async fn accept_with_config<S>(
    stream: S,
    config: Option<WebSocketConfig>,
) -> Result<Upgraded<S>>
where
    S: AsyncReadRent + AsyncWriteRent,
{
    accept_hdr_with_config(stream, NoCallback, config).await
}

/// Accepts the given Stream as a WebSocket.
///
/// This function does the same as [`accept`] but accepts an extra callback
/// for header processing. The callback receives headers of the incoming
/// requests and is able to add extra headers to the reply.
pub async fn accept_hdr<S, C>(stream: S, callback: C) -> Result<Upgraded<S>>
where
    S: AsyncReadRent + AsyncWriteRent,
    C: Callback,
{
    accept_hdr_with_config(stream, callback, None).await
}

/// The same as [`accept_hdr`] but the one can specify a websocket configuration.
pub async fn accept_hdr_with_config<S, C>(
    stream: S,
    callback: C,
    config: Option<WebSocketConfig>,
) -> Result<Upgraded<S>>
where
    S: AsyncReadRent + AsyncWriteRent,
    C: Callback,
{
    server_handshake(stream, callback, config).await
}

/// A WebSocket server bound to a TCP listener.
///
/// Every accepted connection gets its own task: the handshake runs, the new
/// session joins the [`Registry`], and the handler sees its events until the
/// session leaves the registry again on disconnect.
///
/// ```no_run
/// use suede::{Server, Session, Handler, Message, server::ServerStream};
/// use std::rc::Rc;
///
/// struct Echo;
///
/// impl Handler<ServerStream> for Echo {
///     async fn on_message(&self, session: &Rc<Session<ServerStream>>, message: Message) {
///         let _ = session.send(message).await;
///     }
/// }
///
/// #[monoio::main]
/// async fn main() -> suede::Result<()> {
///     Server::bind("127.0.0.1:9001")?.path("/ws").run(Echo).await
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    path: Option<Rc<str>>,
    config: Option<WebSocketConfig>,
    registry: Registry<ServerStream>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("path", &self.path)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Binds a listener to `addr`.
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            path: None,
            config: None,
            registry: Registry::new(),
        })
    }

    /// Only upgrades requests for `path`; others are answered `404 Not Found`.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(Rc::from(path.into()));
        self
    }

    /// Sets the configuration used for handshakes and sessions.
    pub fn config(mut self, config: WebSocketConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle to the sessions currently connected.
    pub fn registry(&self) -> Registry<ServerStream> {
        self.registry.clone()
    }

    /// Accepts connections until the listener fails.
    ///
    /// Handshake failures only affect their own connection: they are logged
    /// and the connection is dropped.
    pub async fn run<H>(self, handler: H) -> Result<()>
    where
        H: Handler<ServerStream> + 'static,
    {
        let handler = Rc::new(handler);
        debug!(addr = ?self.listener.local_addr().ok(), "server listening");

        loop {
            let (stream, peer) = self.listener.accept().await.map_err(Error::Io)?;
            monoio::spawn(serve(
                stream,
                peer,
                self.path.clone(),
                self.config,
                self.registry.clone(),
                handler.clone(),
            ));
        }
    }
}

async fn serve<H>(
    stream: TcpStream,
    peer: SocketAddr,
    path: Option<Rc<str>>,
    config: Option<WebSocketConfig>,
    registry: Registry<ServerStream>,
    handler: Rc<H>,
) where
    H: Handler<ServerStream>,
{
    let upgraded = match path.as_deref() {
        Some(path) => accept_hdr_with_config(stream, PathCallback(path), config).await,
        None => accept_with_config(stream, config).await,
    };
    let upgraded = match upgraded {
        Ok(upgraded) => upgraded,
        Err(err) => {
            warn!(peer = %peer, error = %err, "handshake rejected");
            return;
        }
    };

    let (session, reader) = Session::from_upgraded(upgraded, Role::Server, config);
    debug!(peer = %peer, session = session.id(), "client connected");

    registry.register(session.clone()).await;
    handler.on_connect(&session).await;

    let handler = Registered {
        registry,
        inner: &*handler,
    };
    match session.clone().run(reader, &handler).await {
        Ok(()) => debug!(peer = %peer, session = session.id(), "session closed"),
        Err(err) => debug!(peer = %peer, session = session.id(), error = %err, "session ended"),
    }
}

/// Leaves the registry before the wrapped handler sees the disconnect.
struct Registered<'a, W, H: ?Sized> {
    registry: Registry<W>,
    inner: &'a H,
}

impl<W, H> Handler<W> for Registered<'_, W, H>
where
    H: Handler<W> + ?Sized,
{
    async fn on_connect(&self, session: &Rc<Session<W>>) {
        self.inner.on_connect(session).await;
    }

    async fn on_message(&self, session: &Rc<Session<W>>, message: Message) {
        self.inner.on_message(session, message).await;
    }

    async fn on_disconnect(&self, session: &Rc<Session<W>>) {
        self.registry.unregister(session).await;
        self.inner.on_disconnect(session).await;
    }
}
