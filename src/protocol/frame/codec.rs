//! WebSocket frame codec implementation.
//!
//! Decoding and encoding are split so that the read half and the write half of a
//! connection can each own their side of the codec.

mod decode;
pub use decode::FrameDecoder;

mod encode;
pub use encode::FrameEncoder;
