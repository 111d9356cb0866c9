//! Conversions from `httparse` to the `http` types.

use http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::Result;

/// Limit for the number of header lines.
pub const MAX_HEADERS: usize = 124;

/// Trait to convert raw objects into HTTP parseables.
pub(crate) trait FromHttparse<T>: Sized {
    /// Convert raw object into parsed HTTP headers.
    fn from_httparse(raw: T) -> Result<Self>;
}

impl<'b: 'h, 'h> FromHttparse<&'b [httparse::Header<'h>]> for HeaderMap {
    fn from_httparse(raw: &'b [httparse::Header<'h>]) -> Result<Self> {
        let mut headers = HeaderMap::with_capacity(raw.len());
        for h in raw {
            headers.append(
                HeaderName::from_bytes(h.name.as_bytes())?,
                HeaderValue::from_bytes(h.value)?,
            );
        }

        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers() {
        const DATA: &[u8] = b"Host: foo.com\r\n\
             Connection: Upgrade\r\n\
             Upgrade: websocket\r\n\
             \r\n";
        let mut hdr = [httparse::EMPTY_HEADER; 12];
        let (_, raw) = match httparse::parse_headers(DATA, &mut hdr).unwrap() {
            httparse::Status::Complete(parsed) => parsed,
            httparse::Status::Partial => panic!("headers are complete"),
        };
        let hdr = HeaderMap::from_httparse(raw).unwrap();

        assert_eq!(hdr.get("Host").unwrap(), &b"foo.com"[..]);
        assert_eq!(hdr.get("Upgrade").unwrap(), &b"websocket"[..]);
        assert_eq!(hdr.get("Connection").unwrap(), &b"Upgrade"[..]);
    }

    #[test]
    fn headers_iter() {
        const DATA: &[u8] = b"Host: foo.com\r\n\
              Sec-WebSocket-Extensions: permessage-deflate\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-ExtenSIONS: permessage-unknown\r\n\
              Upgrade: websocket\r\n\
              \r\n";
        let mut hdr = [httparse::EMPTY_HEADER; 12];
        let (_, raw) = match httparse::parse_headers(DATA, &mut hdr).unwrap() {
            httparse::Status::Complete(parsed) => parsed,
            httparse::Status::Partial => panic!("headers are complete"),
        };
        let hdr = HeaderMap::from_httparse(raw).unwrap();
        let mut iter = hdr.get_all("Sec-WebSocket-Extensions").iter();
        assert_eq!(iter.next(), Some(&HeaderValue::from_static("permessage-deflate")));
        assert_eq!(iter.next(), Some(&HeaderValue::from_static("permessage-unknown")));
        assert_eq!(iter.next(), None);
    }
}
