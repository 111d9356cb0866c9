//! Client handshake.

use bytes::BytesMut;
use http::{
    HeaderMap, Request as HttpRequest, Response as HttpResponse, StatusCode,
    header::{self, HeaderName},
};
use httparse::Status;
use monoio::io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt, stream::Stream};
use monoio_codec::{Decoded, Decoder, Encoder, FramedRead};
use tracing::debug;

use super::{
    Upgraded, derive_accept_key,
    headers::{FromHttparse, MAX_HEADERS},
};
use crate::{
    client::uri_port,
    error::{Error, HandshakeError, Result, UrlError},
    protocol::{WebSocketConfig, with_deadline},
};

/// Client request type.
pub type Request = HttpRequest<()>;

/// Client response type.
pub type Response = HttpResponse<Option<Vec<u8>>>;

/// Performs a client handshake over `stream`.
///
/// Sends the upgrade request, reads the server's answer and checks it against
/// the key we sent. On success the stream is returned untouched together with
/// any bytes the server sent after its response head.
pub async fn client_handshake<S>(
    request: Request,
    stream: S,
    config: Option<WebSocketConfig>,
) -> Result<(Upgraded<S>, Response)>
where
    S: AsyncReadRent + AsyncWriteRent,
{
    if request.method() != http::Method::GET {
        return Err(Error::Handshake(HandshakeError::WrongHttpMethod));
    }

    if request.version() < http::Version::HTTP_11 {
        return Err(Error::Handshake(HandshakeError::WrongHttpVersion));
    }

    // Check the URI scheme: only ws or http are supported
    uri_port(request.uri())?;

    let key = get_websocket_key(&request)?;
    let verify_data = VerifyData {
        accept_key: derive_accept_key(key.as_bytes()),
    };

    let config = config.unwrap_or_default();
    let mut stream = stream;

    let mut buf = BytesMut::new();
    RequestEncoder.encode(request, &mut buf)?;
    with_deadline(config.write_timeout, async {
        let (res, _) = stream.write_all(buf).await;
        res?;
        stream.flush().await
    })
    .await?;

    let mut framed = FramedRead::with_capacity(stream, ResponseDecoder, config.initial_read_capacity);
    let next = with_deadline(config.read_timeout, async {
        framed.next().await.transpose()
    })
    .await?;

    match next {
        Some((size, resp)) => {
            let mut read_buf = framed.read_buffer_mut().split();
            let _head = read_buf.split_to(size);

            let resp = match verify_data.verify_response(resp) {
                Ok(r) => r,
                Err(Error::Http(mut e)) => {
                    *e.body_mut() = Some(read_buf.to_vec());
                    return Err(Error::Http(e));
                }
                Err(e) => return Err(e),
            };
            debug!(status = %resp.status(), "client handshake completed");

            Ok((
                Upgraded {
                    io: framed.into_inner(),
                    read_buf,
                },
                resp,
            ))
        }

        None => Err(Error::Handshake(HandshakeError::HandshakeIncomplete)),
    }
}

// Headers that must be present in a correct request, in the order they are sent.
const KEY_HEADERNAME: &str = "Sec-WebSocket-Key";
const WEBSOCKET_HEADERS: [(&str, HeaderName); 5] = [
    ("Host", header::HOST),
    ("Upgrade", header::UPGRADE),
    ("Connection", header::CONNECTION),
    ("Sec-WebSocket-Version", header::SEC_WEBSOCKET_VERSION),
    (KEY_HEADERNAME, header::SEC_WEBSOCKET_KEY),
];

/// Encoder for client request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestEncoder;

impl Encoder<Request> for RequestEncoder {
    type Error = Error;

    fn encode(&mut self, mut req: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(256 + req.headers().len() * 35);

        let path = req
            .uri()
            .path_and_query()
            .ok_or(Error::Url(UrlError::NoPathOrQuery))?
            .as_str();
        dst.extend_from_slice(b"GET ");
        dst.extend_from_slice(path.as_bytes());
        dst.extend_from_slice(b" HTTP/1.1\r\n");

        // The mandatory headers are written first and with their canonical
        // casing: `http` keeps names in lower-case, which is fine by the RFC,
        // but some servers compare header names case-sensitively.
        //
        // See similar problem in `hyper`: https://github.com/hyperium/hyper/issues/1492
        let headers = req.headers_mut();
        for (header, name) in &WEBSOCKET_HEADERS {
            if headers.get_all(name).iter().count() > 1 {
                return Err(Error::Handshake(HandshakeError::InvalidHeader(name.clone())));
            }
            let value = headers
                .remove(name)
                .ok_or_else(|| Error::Handshake(HandshakeError::InvalidHeader(name.clone())))?;

            let value = value.to_str().map_err(|err| {
                Error::Utf8(format!(
                    "{err} for header name '{header}' with value: {value:?}"
                ))
            })?;

            write_header(dst, header, value);
        }

        for (k, v) in headers.iter() {
            let name = if *k == header::ORIGIN {
                "Origin"
            } else {
                k.as_str()
            };

            let value = v.to_str().map_err(|err| {
                Error::Utf8(format!("{err} for header name '{name}' with value: {v:?}"))
            })?;

            write_header(dst, name, value);
        }

        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

fn write_header(dst: &mut BytesMut, name: &str, value: &str) {
    dst.extend_from_slice(name.as_bytes());
    dst.extend_from_slice(b": ");
    dst.extend_from_slice(value.as_bytes());
    dst.extend_from_slice(b"\r\n");
}

fn get_websocket_key(req: &Request) -> Result<&str> {
    let key = req
        .headers()
        .get(KEY_HEADERNAME)
        .ok_or(Error::Handshake(HandshakeError::InvalidHeader(
            header::SEC_WEBSOCKET_KEY,
        )))?
        .to_str()?;
    Ok(key)
}

/// Decoder for response.
///
/// Leaves the buffer untouched; the returned size tells how long the head was.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseDecoder;

impl Decoder for ResponseDecoder {
    type Item = (usize, Response);
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Self::Item>, Self::Error> {
        let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Response::new(&mut hbuffer);

        Ok(match req.parse(src)? {
            Status::Partial => Decoded::Insufficient,
            Status::Complete(size) => Decoded::Some((size, Response::from_httparse(req)?)),
        })
    }
}

impl<'h, 'b: 'h> FromHttparse<httparse::Response<'h, 'b>> for Response {
    fn from_httparse(raw: httparse::Response<'h, 'b>) -> Result<Self> {
        let version = raw
            .version
            .ok_or(Error::Handshake(HandshakeError::HandshakeIncomplete))?;
        if version < /*1.*/1 {
            return Err(Error::Handshake(HandshakeError::WrongHttpVersion));
        }

        let code = raw
            .code
            .ok_or(Error::Handshake(HandshakeError::HandshakeIncomplete))?;
        let headers = HeaderMap::from_httparse(raw.headers)?;

        let mut response = Response::new(None);
        *response.status_mut() = StatusCode::from_u16(code)?;
        *response.headers_mut() = headers;
        // httparse only knows HTTP/1.x, and 1.0 was rejected above.
        *response.version_mut() = http::Version::HTTP_11;

        Ok(response)
    }
}

/// Generates a random key for the `Sec-WebSocket-Key` header.
pub fn generate_key() -> String {
    // a base64-encoded (see Section 4 of [RFC4648]) value that,
    // when decoded, is 16 bytes in length (RFC 6455)
    let r: [u8; 16] = rand::random();
    data_encoding::BASE64.encode(&r)
}

/// Information for handshake verification.
#[derive(Debug, Clone)]
struct VerifyData {
    /// Accepted server key.
    accept_key: String,
}

impl VerifyData {
    /// Verifies the response from the server against the expected values.
    fn verify_response(&self, resp: Response) -> Result<Response> {
        // 1. If the status code received from the server is not 101, the
        // client handles the response per HTTP [RFC2616] procedures. (RFC 6455)
        if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(Error::Http(Box::new(resp)));
        }

        let headers = resp.headers();

        // 2. If the response lacks an |Upgrade| header field or the |Upgrade|
        // header field contains a value that is not an ASCII case-
        // insensitive match for the value "websocket", the client MUST
        // _Fail the WebSocket Connection_. (RFC 6455)
        if !headers
            .get(header::UPGRADE)
            .and_then(|h| h.to_str().ok())
            .map(|h| h.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
        {
            return Err(Error::Handshake(
                HandshakeError::MissingUpgradeWebSocketHeader,
            ));
        }

        // 3. If the response lacks a |Connection| header field or the
        // |Connection| header field doesn't contain a token that is an
        // ASCII case-insensitive match for the value "Upgrade", the client
        // MUST _Fail the WebSocket Connection_. (RFC 6455)
        if !headers
            .get(header::CONNECTION)
            .and_then(|h| h.to_str().ok())
            .map(|h| {
                h.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("Upgrade"))
            })
            .unwrap_or(false)
        {
            return Err(Error::Handshake(
                HandshakeError::MissingConnectionUpgradeHeader,
            ));
        }

        // 4. If the response lacks a |Sec-WebSocket-Accept| header field or
        // the |Sec-WebSocket-Accept| contains a value other than the
        // base64-encoded SHA-1 of ... the client MUST _Fail the WebSocket
        // Connection_. (RFC 6455)
        if !headers
            .get(header::SEC_WEBSOCKET_ACCEPT)
            .map(|h| h == &self.accept_key)
            .unwrap_or(false)
        {
            return Err(Error::Handshake(
                HandshakeError::SecWebSocketAcceptKeyMismatch,
            ));
        }

        Ok(resp)
    }
}
