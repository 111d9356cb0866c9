//! Methods to connect to a WebSocket as a client.

use std::{fmt, rc::Rc};

use http::{HeaderName, Uri};
use monoio::{
    io::{AsyncReadRent, AsyncWriteRent, OwnedWriteHalf},
    net::TcpStream,
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    error::{Error, Result, UrlError},
    handshake::{
        Upgraded,
        client::{Request, Response, client_handshake, generate_key},
    },
    protocol::{Handler, Role, Session, WebSocketConfig},
};

/// Write half of a session opened by [`Client`].
pub type ClientStream = OwnedWriteHalf<TcpStream>;

/// Gets the TCP port for the given URL.
///
/// Only plain-text schemes are supported: `ws` and `http` default to port 80,
/// `wss` and `https` fail with [`UrlError::TlsUnsupported`].
pub fn uri_port(uri: &Uri) -> Result<u16> {
    let default = match uri.scheme_str() {
        Some("ws" | "http") => 80,
        Some("wss" | "https") => return Err(Error::Url(UrlError::TlsUnsupported)),
        _ => return Err(Error::Url(UrlError::UnsupportedUrlScheme)),
    };
    Ok(uri.port_u16().unwrap_or(default))
}

/// Performs the client handshake over the given stream. Passing `None` as
/// configuration means the default one.
pub async fn client<S, R>(
    request: R,
    stream: S,
    config: Option<WebSocketConfig>,
) -> Result<(Upgraded<S>, Response)>
where
    S: AsyncReadRent + AsyncWriteRent,
    R: IntoClientRequest,
{
    client_handshake(request.into_client_request()?, stream, config).await
}

/// A WebSocket client for one server.
///
/// ```no_run
/// use suede::{Client, Handler, Message, Session, client::ClientStream};
/// use std::{fmt, rc::Rc};
///
/// struct Print;
///
/// impl Handler<ClientStream> for Print {
///     async fn on_message(&self, _session: &Rc<Session<ClientStream>>, message: Message) {
///         println!("{message}");
///     }
/// }
///
/// #[monoio::main]
/// async fn main() -> suede::Result<()> {
///     let connection = Client::new("ws://127.0.0.1:9001/ws")?.connect(Print).await?;
///     connection.session().send("hello").await?;
///     connection.join().await
/// }
/// ```
#[derive(Debug)]
pub struct Client {
    request: Request,
    config: Option<WebSocketConfig>,
    disable_nagle: bool,
}

impl Client {
    /// Creates a client for `request`, often just a `ws://` URL.
    pub fn new<R: IntoClientRequest>(request: R) -> Result<Self> {
        Ok(Self {
            request: request.into_client_request()?,
            config: None,
            disable_nagle: false,
        })
    }

    /// Sets the configuration used for the handshake and the session.
    pub fn config(mut self, config: WebSocketConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Disables Nagle's algorithm on the socket, i.e. `set_nodelay(true)`.
    /// If you don't know what the Nagle's algorithm is, better leave it alone.
    pub fn disable_nagle(mut self, disable: bool) -> Self {
        self.disable_nagle = disable;
        self
    }

    /// Dials the server and opens a session.
    ///
    /// Once the handshake succeeded, [`Handler::on_connect`] runs, then the
    /// session's read loop is spawned and the caller gets control back.
    pub async fn connect<H>(self, handler: H) -> Result<Connection>
    where
        H: Handler<ClientStream> + 'static,
    {
        let uri = self.request.uri();
        let port = uri_port(uri)?;
        let host = match uri.host() {
            Some(d) if d.starts_with('[') && d.ends_with(']') => d[1..d.len() - 1].to_string(),
            Some(d) => d.to_string(),
            None => return Err(Error::Url(UrlError::NoHostName)),
        };

        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(Error::Dial)?;
        if self.disable_nagle {
            stream.set_nodelay(true)?;
        }

        let (upgraded, response) = client_handshake(self.request, stream, self.config).await?;
        let (session, reader) = Session::from_upgraded(upgraded, Role::Client, self.config);
        debug!(session = session.id(), host = %host, port, "session opened");

        handler.on_connect(&session).await;
        let task = monoio::spawn({
            let session = session.clone();
            async move { session.run(reader, &handler).await }
        });

        Ok(Connection {
            session,
            response,
            task,
        })
    }

    /// Connects and drives the session until it ends.
    pub async fn run<H>(self, handler: H) -> Result<()>
    where
        H: Handler<ClientStream> + 'static,
    {
        self.connect(handler).await?.join().await
    }
}

/// An open client session whose read loop runs in its own task.
pub struct Connection {
    session: Rc<Session<ClientStream>>,
    response: Response,
    task: JoinHandle<Result<()>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("session", &self.session)
            .field("status", &self.response.status())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// The session, for sending and closing.
    pub fn session(&self) -> &Rc<Session<ClientStream>> {
        &self.session
    }

    /// The server's handshake response.
    pub fn response(&self) -> &Response {
        &self.response
    }

    /// Waits for the read loop to finish.
    ///
    /// Returns `Ok(())` after a completed closing handshake and the error that
    /// ended the session otherwise.
    pub async fn join(self) -> Result<()> {
        self.task.await
    }
}

/// Trait for converting various types into HTTP requests used for a client connection.
///
/// This trait is implemented by default for string slices, strings, [`http::Uri`] and
/// [`http::Request<()>`]. Note that the implementation for [`http::Request<()>`] is trivial and
/// will simply take your request and pass it as is further without altering any headers or URLs, so
/// be aware of this.
pub trait IntoClientRequest {
    /// Convert into a `Request` that can be used for a client connection.
    fn into_client_request(self) -> Result<Request>;
}

impl IntoClientRequest for &str {
    fn into_client_request(self) -> Result<Request> {
        self.parse::<Uri>()?.into_client_request()
    }
}

impl IntoClientRequest for &String {
    fn into_client_request(self) -> Result<Request> {
        <&str as IntoClientRequest>::into_client_request(self)
    }
}

impl IntoClientRequest for String {
    fn into_client_request(self) -> Result<Request> {
        <&str as IntoClientRequest>::into_client_request(&self)
    }
}

impl IntoClientRequest for &Uri {
    fn into_client_request(self) -> Result<Request> {
        self.clone().into_client_request()
    }
}

impl IntoClientRequest for Uri {
    fn into_client_request(self) -> Result<Request> {
        let authority = self
            .authority()
            .ok_or(Error::Url(UrlError::NoHostName))?
            .as_str();
        let host = authority
            .find('@')
            .map(|idx| authority.split_at(idx + 1).1)
            .unwrap_or_else(|| authority);

        if host.is_empty() {
            return Err(Error::Url(UrlError::EmptyHostName));
        }

        let req = Request::builder()
            .method("GET")
            .header("Host", host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key())
            .uri(self)
            .body(())?;
        Ok(req)
    }
}

#[cfg(feature = "url")]
impl IntoClientRequest for &url::Url {
    fn into_client_request(self) -> Result<Request> {
        self.as_str().into_client_request()
    }
}

#[cfg(feature = "url")]
impl IntoClientRequest for url::Url {
    fn into_client_request(self) -> Result<Request> {
        self.as_str().into_client_request()
    }
}

impl IntoClientRequest for Request {
    fn into_client_request(self) -> Result<Request> {
        Ok(self)
    }
}

impl IntoClientRequest for httparse::Request<'_, '_> {
    fn into_client_request(self) -> Result<Request> {
        use crate::handshake::headers::FromHttparse;

        Request::from_httparse(self)
    }
}

/// Builder for a custom [`IntoClientRequest`] with additional headers.
#[derive(Debug, Clone)]
pub struct ClientRequestBuilder {
    uri: Uri,
    /// Additional [`Request`] handshake headers
    additional_headers: Vec<(String, String)>,
}

impl ClientRequestBuilder {
    /// Initializes an empty request builder
    #[must_use]
    pub const fn new(uri: Uri) -> Self {
        Self {
            uri,
            additional_headers: Vec::new(),
        }
    }

    /// Adds (`key`, `value`) as an additional header to the handshake request
    pub fn with_header<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.additional_headers.push((key.into(), value.into()));
        self
    }
}

impl IntoClientRequest for ClientRequestBuilder {
    fn into_client_request(self) -> Result<Request> {
        let mut request = self.uri.into_client_request()?;
        let headers = request.headers_mut();
        for (k, v) in self.additional_headers {
            let key = HeaderName::try_from(k)?;
            let value = v.parse()?;
            headers.append(key, value);
        }
        Ok(request)
    }
}
