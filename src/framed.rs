// This file is modified from https://github.com/monoio-rs/monoio-codec/blob/fa8e401122b93c33515afbe3268d0a59730e42c1/src/framed.rs
//
// The original code is dual-licensed under MIT or Apache 2.0.
//
// Copyright (c) 2024 Monoio Contributors
//
// The full text of both licenses is available in the `NOTICE` file in the root of this repository.

use bytes::BytesMut;
use monoio::io::{AsyncWriteRent, AsyncWriteRentExt, sink::Sink};
use monoio_codec::Encoder;

/// Write half of a framed stream.
///
/// Items are encoded into an owned buffer which is handed to the stream as a
/// whole on [`Sink::flush`], so one item never reaches the wire in pieces
/// interleaved with another writer's bytes.
#[derive(Debug)]
pub struct FramedWrite<IO, Codec> {
    io: IO,
    codec: Codec,
    pending: BytesMut,
}

impl<IO, Codec> FramedWrite<IO, Codec> {
    pub fn new(io: IO, codec: Codec) -> Self {
        Self {
            io,
            codec,
            pending: BytesMut::new(),
        }
    }

    /// The stream being written to.
    #[inline]
    pub fn get_mut(&mut self) -> &mut IO {
        &mut self.io
    }

    async fn write_pending(&mut self) -> std::io::Result<()>
    where
        IO: AsyncWriteRent,
    {
        if !self.pending.is_empty() {
            let (res, mut written) = self.io.write_all(std::mem::take(&mut self.pending)).await;
            // A half-written frame must not be completed by a later write.
            written.clear();
            self.pending = written;
            res?;
        }
        self.io.flush().await
    }
}

impl<IO, Codec, Item> Sink<Item> for FramedWrite<IO, Codec>
where
    IO: AsyncWriteRent,
    Codec: Encoder<Item>,
    Codec::Error: From<std::io::Error>,
{
    type Error = Codec::Error;

    async fn send(&mut self, item: Item) -> Result<(), Self::Error> {
        self.codec.encode(item, &mut self.pending)
    }

    async fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(self.write_pending().await?)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.write_pending().await?;
        Ok(self.io.shutdown().await?)
    }
}
