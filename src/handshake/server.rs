//! Server handshake.

use bytes::BytesMut;
use http::{
    HeaderMap, Request as HttpRequest, Response as HttpResponse, StatusCode,
    header::{self, HeaderName},
    response::Builder,
};
use httparse::Status;
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt, stream::Stream};
use monoio_codec::{Decoded, Decoder, FramedRead};
use tracing::debug;

use super::{
    Upgraded, derive_accept_key,
    headers::{FromHttparse, MAX_HEADERS},
};
use crate::{
    error::{Error, HandshakeError, Result},
    protocol::{WebSocketConfig, with_deadline},
};

/// Server request type.
pub type Request = HttpRequest<()>;

/// Server response type.
pub type Response = HttpResponse<()>;

/// Server error response type.
pub type ErrorResponse = HttpResponse<Option<String>>;

/// Performs a server handshake over `stream`.
///
/// Reads the upgrade request, lets `callback` inspect it and answers with
/// `101 Switching Protocols`. A request that is not a valid upgrade is
/// answered with `400 Bad Request`, and a request the callback rejects with
/// the callback's response; both end in an error and the stream is dropped.
pub async fn server_handshake<S, C>(
    stream: S,
    callback: C,
    config: Option<WebSocketConfig>,
) -> Result<Upgraded<S>>
where
    S: AsyncReadRent + AsyncWriteRent,
    C: Callback,
{
    let config = config.unwrap_or_default();
    let mut framed = FramedRead::with_capacity(stream, RequestDecoder, config.initial_read_capacity);

    let next = with_deadline(config.read_timeout, async {
        framed.next().await.transpose()
    })
    .await;

    let (size, req) = match next {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return Err(Error::Handshake(HandshakeError::HandshakeIncomplete)),
        Err(
            err @ (Error::Handshake(_)
            | Error::Capacity(_)
            | Error::HttpFormat(_)
            | Error::Utf8(_)),
        ) => {
            reject_malformed(framed.get_mut(), &err, &config).await;
            return Err(err);
        }
        Err(err) => return Err(err),
    };

    if framed.read_buffer().len() != size {
        return Err(Error::Handshake(HandshakeError::JunkAfterRequest));
    }

    let resp = match create_response(&req) {
        Ok(resp) => resp,
        Err(err) => {
            reject_malformed(framed.get_mut(), &err, &config).await;
            return Err(err);
        }
    };

    match callback.on_request(&req, resp) {
        Ok(resp) => {
            let buf = generate_response(&resp);
            let io = framed.get_mut();
            with_deadline(config.write_timeout, async {
                let (res, _) = io.write_all(buf).await;
                res?;
                io.flush().await
            })
            .await?;
            debug!(path = req.uri().path(), "server handshake completed");

            framed.read_buffer_mut().clear();
            Ok(Upgraded {
                io: framed.into_inner(),
                read_buf: BytesMut::new(),
            })
        }

        Err(resp) => {
            if resp.status().is_success() {
                return Err(Error::Handshake(HandshakeError::CustomResponseSuccessful));
            }

            let mut buf = generate_response(&resp);
            if let Some(body) = resp.body() {
                buf.extend_from_slice(body.as_bytes());
            }
            let io = framed.get_mut();
            with_deadline(config.write_timeout, async {
                let (res, _) = io.write_all(buf).await;
                res?;
                io.flush().await
            })
            .await?;
            debug!(path = req.uri().path(), status = %resp.status(), "upgrade request rejected");

            let (parts, body) = resp.into_parts();
            let body = body.map(String::into_bytes);
            Err(Error::Http(Box::new(http::Response::from_parts(
                parts, body,
            ))))
        }
    }
}

/// Answers a request that is not a valid upgrade. Write failures are ignored,
/// the handshake error is what the caller gets either way.
async fn reject_malformed<S>(io: &mut S, err: &Error, config: &WebSocketConfig)
where
    S: AsyncWriteRent,
{
    let reason = err.to_string();
    let mut buf = format!(
        "HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        reason.len()
    )
    .into_bytes();
    buf.extend_from_slice(reason.as_bytes());

    let res = with_deadline(config.write_timeout, async {
        let (res, _) = io.write_all(buf).await;
        res?;
        io.flush().await
    })
    .await;
    if let Err(err) = res {
        debug!(error = %err, "failed to send 400 response");
    }
}

fn create_parts<T>(request: &HttpRequest<T>) -> Result<Builder> {
    if request.method() != http::Method::GET {
        return Err(Error::Handshake(HandshakeError::WrongHttpMethod));
    }

    if request.version() < http::Version::HTTP_11 {
        return Err(Error::Handshake(HandshakeError::WrongHttpVersion));
    }

    if !request
        .headers()
        .get(header::CONNECTION)
        .and_then(|h| h.to_str().ok())
        .map(|h| {
            h.split([' ', ','])
                .any(|p| p.eq_ignore_ascii_case("Upgrade"))
        })
        .unwrap_or(false)
    {
        return Err(Error::Handshake(
            HandshakeError::MissingConnectionUpgradeHeader,
        ));
    }

    if !request
        .headers()
        .get(header::UPGRADE)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(Error::Handshake(
            HandshakeError::MissingUpgradeWebSocketHeader,
        ));
    }

    if !request
        .headers()
        .get(header::SEC_WEBSOCKET_VERSION)
        .map(|h| h == "13")
        .unwrap_or(false)
    {
        return Err(Error::Handshake(
            HandshakeError::MissingSecWebSocketVersionHeader,
        ));
    }

    let key = request
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(Error::Handshake(HandshakeError::MissingSecWebSocketKey))?;

    let builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .version(request.version())
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, derive_accept_key(key.as_bytes()));

    Ok(builder)
}

/// Creates a response for the request.
pub fn create_response(request: &Request) -> Result<Response> {
    Ok(create_parts(request)?.body(())?)
}

/// Creates a response for the request with a custom body.
pub fn create_response_with_body<T1, T2>(
    request: &HttpRequest<T1>,
    generate_body: impl FnOnce() -> T2,
) -> Result<HttpResponse<T2>> {
    Ok(create_parts(request)?.body(generate_body())?)
}

// Written first, in this order and casing, whenever the response carries them.
const UPGRADE_HEADERS: [(&str, HeaderName); 3] = [
    ("Upgrade", header::UPGRADE),
    ("Connection", header::CONNECTION),
    ("Sec-WebSocket-Accept", header::SEC_WEBSOCKET_ACCEPT),
];

fn generate_response<T>(resp: &HttpResponse<T>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);

    let status = resp.status();
    buf.extend_from_slice(b"HTTP/1.1 ");
    buf.extend_from_slice(status.as_str().as_bytes());
    if let Some(reason) = status.canonical_reason() {
        buf.push(b' ');
        buf.extend_from_slice(reason.as_bytes());
    }
    buf.extend_from_slice(b"\r\n");

    let headers = resp.headers();
    for (canonical, name) in &UPGRADE_HEADERS {
        for value in headers.get_all(name) {
            write_header(&mut buf, canonical.as_bytes(), value.as_bytes());
        }
    }
    for (k, v) in headers {
        if UPGRADE_HEADERS.iter().any(|(_, name)| name == k) {
            continue;
        }
        write_header(&mut buf, k.as_str().as_bytes(), v.as_bytes());
    }

    buf.extend_from_slice(b"\r\n");
    buf
}

fn write_header(buf: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    buf.extend_from_slice(name);
    buf.extend_from_slice(b": ");
    buf.extend_from_slice(value);
    buf.extend_from_slice(b"\r\n");
}

/// Decoder for Request.
///
/// Leaves the buffer untouched; the returned size tells how long the head was.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestDecoder;

impl Decoder for RequestDecoder {
    type Item = (usize, Request);
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Self::Item>, Self::Error> {
        let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut hbuffer);

        Ok(match req.parse(src)? {
            Status::Partial => Decoded::Insufficient,
            Status::Complete(size) => Decoded::Some((size, Request::from_httparse(req)?)),
        })
    }
}

impl<'h, 'b: 'h> FromHttparse<httparse::Request<'h, 'b>> for Request {
    fn from_httparse(raw: httparse::Request<'h, 'b>) -> Result<Self> {
        if raw.method != Some("GET") {
            return Err(Error::Handshake(HandshakeError::WrongHttpMethod));
        }

        let version = raw
            .version
            .ok_or(Error::Handshake(HandshakeError::HandshakeIncomplete))?;
        if version < /*1.*/1 {
            return Err(Error::Handshake(HandshakeError::WrongHttpVersion));
        }

        let path = raw
            .path
            .ok_or(Error::Handshake(HandshakeError::HandshakeIncomplete))?;
        let headers = HeaderMap::from_httparse(raw.headers)?;

        let mut request = Request::new(());
        *request.method_mut() = http::Method::GET;
        *request.headers_mut() = headers;
        *request.uri_mut() = path.parse()?;
        // httparse only knows HTTP/1.x, and 1.0 was rejected above.
        *request.version_mut() = http::Version::HTTP_11;

        Ok(request)
    }
}

/// The callback trait.
///
/// The callback is called when the server receives an incoming WebSocket
/// handshake request from the client. Specifying a callback allows you to analyze incoming headers
/// and add additional headers to the response that server sends to the client and/or reject the
/// connection based on the incoming headers.
pub trait Callback: Sized {
    /// Called whenever the server read the request from the client and is ready to reply to it.
    /// May return additional reply headers.
    /// Returning an error resulting in rejecting the incoming connection.
    fn on_request(self, req: &Request, resp: Response) -> Result<Response, Box<ErrorResponse>>;
}

impl<F> Callback for F
where
    F: FnOnce(&Request, Response) -> Result<Response, Box<ErrorResponse>>,
{
    fn on_request(self, req: &Request, resp: Response) -> Result<Response, Box<ErrorResponse>> {
        self(req, resp)
    }
}

/// Stub for callback that does nothing.
#[derive(Clone, Copy, Debug)]
pub struct NoCallback;

impl Callback for NoCallback {
    fn on_request(self, _req: &Request, resp: Response) -> Result<Response, Box<ErrorResponse>> {
        Ok(resp)
    }
}

/// Only accepts upgrades for one request path, answering `404 Not Found` otherwise.
#[derive(Clone, Copy, Debug)]
pub struct PathCallback<'a>(pub &'a str);

impl Callback for PathCallback<'_> {
    fn on_request(self, req: &Request, resp: Response) -> Result<Response, Box<ErrorResponse>> {
        if req.uri().path() == self.0 {
            return Ok(resp);
        }
        let mut not_found = ErrorResponse::new(Some("Not Found".to_owned()));
        *not_found.status_mut() = StatusCode::NOT_FOUND;
        not_found
            .headers_mut()
            .insert(header::CONNECTION, header::HeaderValue::from_static("close"));
        not_found
            .headers_mut()
            .insert(header::CONTENT_LENGTH, header::HeaderValue::from_static("9"));
        Err(Box::new(not_found))
    }
}
