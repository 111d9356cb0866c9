use std::io::Cursor;

use bytes::{Buf, BytesMut};
use monoio_codec::{Decoded, Decoder};

use crate::{
    error::{CapacityError, Error, ProtocolError},
    protocol::{
        Role,
        frame::{Frame, FrameHeader, mask::apply_mask},
    },
};

/// Decoder for WebSocket frames.
///
/// The header is parsed as soon as its bytes are buffered; the payload is
/// yielded only once all of it has arrived, so a decoded [`Frame`] always
/// carries the full announced length, unmasked.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    /// Header of the frame currently being read, with its payload length.
    header: Option<(FrameHeader, u64)>,
    /// Which side of the connection we are; decides the masking rule.
    role: Role,
    max_frame_size: Option<usize>,
    accept_unmasked: bool,
}

impl FrameDecoder {
    /// Creates a new `FrameDecoder` for the given side of the connection.
    pub fn new(role: Role, max_frame_size: Option<usize>, accept_unmasked: bool) -> Self {
        Self {
            header: None,
            role,
            max_frame_size,
            accept_unmasked,
        }
    }

    fn check_header(&self, header: &FrameHeader, length: u64) -> Result<(), Error> {
        match self.role {
            // The server MUST close the connection upon receiving a
            // frame that is not masked. (RFC 6455)
            Role::Server if header.mask.is_none() && !self.accept_unmasked => {
                return Err(Error::Protocol(ProtocolError::UnmaskedFrameFromClient));
            }
            // A client MUST close a connection if it detects a masked frame. (RFC 6455)
            Role::Client if header.mask.is_some() => {
                return Err(Error::Protocol(ProtocolError::MaskedFrameFromServer));
            }
            _ => {}
        }

        if let Some(max_size) = self.max_frame_size {
            let size = usize::try_from(length).unwrap_or(usize::MAX);
            if size > max_size {
                return Err(Error::Capacity(CapacityError::MessageTooLong { size, max_size }));
            }
        } else if usize::try_from(length).is_err() {
            return Err(Error::Capacity(CapacityError::MessageTooLong {
                size: usize::MAX,
                max_size: usize::MAX,
            }));
        }

        Ok(())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(Role::Client, None, false)
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Self::Item>, Self::Error> {
        if self.header.is_none() {
            let mut cursor = Cursor::new(&src[..]);
            let Some((header, length)) = FrameHeader::parse(&mut cursor)? else {
                return Ok(Decoded::Insufficient);
            };
            self.check_header(&header, length)?;

            let consumed = cursor.position() as usize;
            src.advance(consumed);
            self.header = Some((header, length));
        }

        let length = match self.header {
            Some((_, length)) => length as usize,
            None => return Ok(Decoded::Insufficient),
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(Decoded::Insufficient);
        }

        let Some((mut header, _)) = self.header.take() else {
            return Ok(Decoded::Insufficient);
        };

        let mut payload = src.split_to(length);
        if let Some(mask) = header.mask.take() {
            apply_mask(&mut payload, mask);
        }

        Ok(Decoded::Some(Frame::from_payload(header, payload.freeze())))
    }
}

#[cfg(test)]
mod tests {
    use bytes::BufMut;

    use super::*;
    use crate::protocol::frame::coding::{Control, Data, OpCode};

    fn decode_all(decoder: &mut FrameDecoder, src: &mut BytesMut) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Decoded::Some(frame) = decoder.decode(src).unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn expect_frame(decoded: Decoded<Frame>) -> Frame {
        match decoded {
            Decoded::Some(frame) => frame,
            _ => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn decodes_unmasked_frames_on_client() {
        let mut src = BytesMut::from(
            &[
                0x89, 0x02, 0x01, 0x02, 0x8a, 0x01, 0x03, 0x01, 0x07, 0x48, 0x65, 0x6c, 0x6c,
                0x6f, 0x2c, 0x20, 0x80, 0x06, 0x57, 0x6f, 0x72, 0x6c, 0x64, 0x21,
            ][..],
        );
        let frames = decode_all(&mut FrameDecoder::new(Role::Client, None, false), &mut src);

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].header().opcode, OpCode::Control(Control::Ping));
        assert_eq!(frames[0].payload(), &[0x01, 0x02]);
        assert_eq!(frames[1].header().opcode, OpCode::Control(Control::Pong));
        assert_eq!(frames[2].header().opcode, OpCode::Data(Data::Text));
        assert!(!frames[2].header().is_final);
        assert_eq!(frames[2].payload(), b"Hello, ");
        assert_eq!(frames[3].header().opcode, OpCode::Data(Data::Continue));
        assert!(frames[3].header().is_final);
        assert_eq!(frames[3].payload(), b"World!");
        assert!(src.is_empty());
    }

    #[test]
    fn unmasks_on_server() {
        // RFC 6455 section 5.7: a masked "Hello".
        let mut src = BytesMut::from(
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58][..],
        );
        let frame = FrameDecoder::new(Role::Server, None, false)
            .decode(&mut src)
            .map(expect_frame)
            .unwrap();
        assert_eq!(frame.payload(), b"Hello");
    }

    #[test]
    fn server_rejects_unmasked() {
        let mut src = BytesMut::from(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o'][..]);
        let err = FrameDecoder::new(Role::Server, None, false)
            .decode(&mut src)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnmaskedFrameFromClient)
        ));

        let mut src = BytesMut::from(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o'][..]);
        let frame = FrameDecoder::new(Role::Server, None, true)
            .decode(&mut src)
            .map(expect_frame)
            .unwrap();
        assert_eq!(frame.payload(), b"Hello");
    }

    #[test]
    fn client_rejects_masked() {
        let mut src = BytesMut::from(
            &[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58][..],
        );
        let err = FrameDecoder::new(Role::Client, None, false)
            .decode(&mut src)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::MaskedFrameFromServer)
        ));
    }

    #[test]
    fn waits_for_the_whole_payload() {
        let mut decoder = FrameDecoder::new(Role::Client, None, false);
        let payload: Vec<u8> = (0..300u16).map(|i| i as u8).collect();

        let mut wire = BytesMut::new();
        wire.put_slice(&[0x82, 0x7E, 0x01, 0x2C]);
        wire.put_slice(&payload);

        // Feed the bytes in uneven pieces, like short reads from a socket.
        let mut src = BytesMut::new();
        let mut decoded = None;
        for chunk in wire.chunks(97) {
            src.extend_from_slice(chunk);
            if let Decoded::Some(frame) = decoder.decode(&mut src).unwrap() {
                decoded = Some(frame);
            }
        }

        let frame = decoded.expect("frame must be decoded once complete");
        assert_eq!(frame.payload(), &payload[..]);
    }

    #[test]
    fn frame_size_limit() {
        let mut src = BytesMut::from(&[0x82, 0x7E, 0x01, 0x00][..]);
        let err = FrameDecoder::new(Role::Client, Some(255), false)
            .decode(&mut src)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Capacity(CapacityError::MessageTooLong {
                size: 256,
                max_size: 255
            })
        ));
    }
}
