use bytes::BytesMut;
use monoio_codec::Encoder;

use crate::{
    error::Error,
    protocol::frame::{Frame, FrameHeader, frame::LengthFormat, mask::apply_mask},
};

/// Writes frames onto the wire, masking the payload when the header carries a key.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEncoder;

fn first_byte(header: &FrameHeader) -> u8 {
    [
        (header.is_final, 0x80),
        (header.rsv1, 0x40),
        (header.rsv2, 0x20),
        (header.rsv3, 0x10),
    ]
    .into_iter()
    .filter(|&(set, _)| set)
    .fold(u8::from(header.opcode), |byte, (_, bit)| byte | bit)
}

fn put_header(header: &FrameHeader, payload_len: u64, dst: &mut BytesMut) {
    let format = LengthFormat::for_length(payload_len);
    let mask_bit = if header.mask.is_some() { 0x80 } else { 0 };
    dst.extend_from_slice(&[first_byte(header), format.length_byte() | mask_bit]);

    match format {
        LengthFormat::U8(_) => {}
        LengthFormat::U16 => dst.extend_from_slice(&(payload_len as u16).to_be_bytes()),
        LengthFormat::U64 => dst.extend_from_slice(&payload_len.to_be_bytes()),
    }
    if let Some(key) = &header.mask {
        dst.extend_from_slice(key);
    }
}

impl Encoder<Frame> for FrameEncoder {
    type Error = Error;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(frame.len());
        put_header(&frame.header, frame.payload.len() as u64, dst);

        let payload_start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(key) = frame.header.mask.take() {
            apply_mask(&mut dst[payload_start..], key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use monoio_codec::{Decoded, Decoder};

    use super::*;
    use crate::protocol::{
        Role,
        frame::{
            codec::FrameDecoder,
            coding::{Data, OpCode},
        },
    };

    #[test]
    fn ping_is_0x89() {
        let mut buf = BytesMut::new();
        let frame = Frame::ping(vec![0x01, 0x02]);
        FrameEncoder.encode(frame, &mut buf).unwrap();
        assert_eq!(buf, vec![0x89, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn text_send_uses_0x81() {
        let mut buf = BytesMut::new();
        let frame = Frame::message("hi", OpCode::Data(Data::Text), true);
        FrameEncoder.encode(frame, &mut buf).unwrap();
        assert_eq!(buf, vec![0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn masked_payload_is_xored() {
        let mut buf = BytesMut::new();
        let mut frame = Frame::message("Hello", OpCode::Data(Data::Text), true);
        frame.header_mut().mask = Some([0x37, 0xfa, 0x21, 0x3d]);
        FrameEncoder.encode(frame, &mut buf).unwrap();
        assert_eq!(
            buf,
            vec![0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn round_trip_all_length_forms() {
        for len in [0usize, 10, 125, 126, 130, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

            for masked in [false, true] {
                let mut frame =
                    Frame::message(payload.clone(), OpCode::Data(Data::Binary), len % 2 == 0);
                if masked {
                    frame.set_random_mask();
                }

                let mut wire = BytesMut::new();
                FrameEncoder.encode(frame, &mut wire).unwrap();

                let header_len = match len {
                    0..=125 => 2,
                    126..=65535 => 4,
                    _ => 10,
                } + if masked { 4 } else { 0 };
                assert_eq!(wire.len(), header_len + len, "length {len}");

                // Masked frames travel to a server, unmasked ones to a client.
                let role = if masked { Role::Server } else { Role::Client };
                let decoded = match FrameDecoder::new(role, None, false)
                    .decode(&mut wire)
                    .unwrap()
                {
                    Decoded::Some(frame) => frame,
                    _ => panic!("frame of length {len} not decoded"),
                };

                assert!(wire.is_empty());
                assert_eq!(decoded.header().opcode, OpCode::Data(Data::Binary));
                assert_eq!(decoded.header().is_final, len % 2 == 0);
                assert_eq!(decoded.payload(), &payload[..], "length {len}");
            }
        }
    }
}
