use std::{
    cell::Cell,
    fmt, io,
    pin::pin,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use futures::{
    StreamExt as _,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
    future::{self, Either},
    lock::Mutex,
};
#[cfg(feature = "handshake")]
use monoio::io::{OwnedReadHalf, OwnedWriteHalf, Split, Splitable};
use monoio::io::{AsyncReadRent, AsyncWriteRent, sink::Sink, stream::Stream};
use monoio_codec::FramedRead;
use tracing::{debug, trace};

#[cfg(feature = "handshake")]
use crate::handshake::Upgraded;
use crate::{
    error::{Error, ProtocolError, Result},
    framed::FramedWrite,
    protocol::{
        Role, WebSocketConfig,
        frame::{
            CloseFrame, Frame, Utf8Bytes,
            codec::{FrameDecoder, FrameEncoder},
            coding::{CloseCode, Control as OpCtl, Data as OpData, OpCode},
        },
        message::{IncompleteMessage, IncompleteMessageType, Message},
        with_deadline,
    },
};

/// All control frames MUST have a payload length of 125 bytes or less. (RFC 6455)
const MAX_CONTROL_PAYLOAD: usize = 125;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a [`Session`].
///
/// A session only exists once the opening handshake succeeded, so it starts
/// out `Open`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SessionState {
    /// Messages flow both ways.
    Open,
    /// A close frame was sent or received, or a write failed; nothing more may be sent.
    Closing,
    /// The stream was released.
    Closed,
}

/// Callbacks invoked by a session's read loop.
///
/// Every method has an empty default, so a handler only implements what it
/// cares about. [`on_message`](Handler::on_message) is awaited before the next
/// frame is read, so messages of one session are handled in wire order and
/// never concurrently.
#[allow(async_fn_in_trait)]
pub trait Handler<W> {
    /// The session is established and may be written to.
    async fn on_connect(&self, _session: &Rc<Session<W>>) {}

    /// A complete message arrived.
    async fn on_message(&self, _session: &Rc<Session<W>>, _message: Message) {}

    /// The session ended and its stream was released. Called exactly once.
    async fn on_disconnect(&self, _session: &Rc<Session<W>>) {}
}

impl<W> Handler<W> for () {}

/// One established WebSocket connection.
///
/// The session owns the write half of the stream behind an async lock, so it
/// can be shared (`Rc<Session<W>>`) between the read loop, handlers and a
/// [`Registry`](crate::Registry) while every frame is written atomically.
/// The read half lives in a [`FrameReader`] consumed by [`Session::run`].
pub struct Session<W> {
    id: u64,
    role: Role,
    config: WebSocketConfig,
    state: Cell<SessionState>,
    disconnected: Cell<bool>,
    writer: Mutex<Option<FramedWrite<W, FrameEncoder>>>,
    interrupts: UnboundedSender<Interrupt>,
}

/// Tells a read loop to stop waiting on the peer.
#[derive(Debug, Clone, Copy)]
enum Interrupt {
    /// Our close frame is out; the peer has `close_timeout` to answer.
    Closing,
    /// A write failed, the stream can no longer carry frames.
    WriteFailed(io::ErrorKind),
}

impl<W> fmt::Debug for Session<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state.get())
            .finish_non_exhaustive()
    }
}

impl<W> Session<W> {
    /// Builds a session from an already upgraded pair of stream halves.
    ///
    /// No handshake is performed; `role` decides the masking rules.
    pub fn from_raw_parts<R>(
        reader: R,
        writer: W,
        role: Role,
        config: Option<WebSocketConfig>,
    ) -> (Rc<Self>, FrameReader<R>) {
        Self::with_read_buf(reader, writer, role, config, &[])
    }

    fn with_read_buf<R>(
        reader: R,
        writer: W,
        role: Role,
        config: Option<WebSocketConfig>,
        read_buf: &[u8],
    ) -> (Rc<Self>, FrameReader<R>) {
        let config = config.unwrap_or_default();
        let (interrupts, interrupted) = unbounded();
        let session = Rc::new(Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            role,
            config,
            state: Cell::new(SessionState::Open),
            disconnected: Cell::new(false),
            writer: Mutex::new(Some(FramedWrite::new(writer, FrameEncoder))),
            interrupts,
        });
        debug!(session = session.id, ?role, "session opened");

        let mut reader = FrameReader::new(reader, role, &config);
        reader.interrupts = Some(interrupted);
        reader.framed.read_buffer_mut().extend_from_slice(read_buf);
        (session, reader)
    }

    /// Unique id of this session within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Client or server side.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The configuration the session was built with.
    pub fn config(&self) -> &WebSocketConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Tells whether messages may still be sent.
    pub fn is_open(&self) -> bool {
        self.state.get() == SessionState::Open
    }

    fn check_open(&self) -> Result<()> {
        match self.state.get() {
            SessionState::Open => Ok(()),
            SessionState::Closing => Err(Error::Protocol(ProtocolError::SendAfterClosing)),
            SessionState::Closed => Err(Error::AlreadyClosed),
        }
    }
}

#[cfg(feature = "handshake")]
impl<S> Session<OwnedWriteHalf<S>>
where
    S: Split + AsyncReadRent + AsyncWriteRent,
{
    /// Splits a freshly upgraded stream into a session and its reader.
    ///
    /// Bytes the handshake read past the HTTP head are handed to the reader.
    pub fn from_upgraded(
        upgraded: Upgraded<S>,
        role: Role,
        config: Option<WebSocketConfig>,
    ) -> (Rc<Self>, FrameReader<OwnedReadHalf<S>>) {
        let Upgraded { io, read_buf } = upgraded;
        let (reader, writer) = Splitable::into_split(io);
        Self::with_read_buf(reader, writer, role, config, &read_buf)
    }
}

impl<W> Session<W>
where
    W: AsyncWriteRent,
{
    /// Sends a data message.
    ///
    /// Strings go out as text frames, byte buffers as binary frames. Concurrent
    /// callers are serialized, a frame is never interleaved with another.
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        self.check_open()?;
        let frame = match message.into() {
            Message::Text(data) => Frame::message(data, OpCode::Data(OpData::Text), true),
            Message::Binary(data) => Frame::message(data, OpCode::Data(OpData::Binary), true),
        };
        self.write_frame(frame).await
    }

    /// Sends a ping with an application payload of up to 125 bytes.
    pub async fn ping(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
        }
        self.check_open()?;
        self.write_frame(Frame::ping(payload)).await
    }

    /// Sends an unsolicited pong with an application payload of up to 125 bytes.
    pub async fn pong(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
        }
        self.check_open()?;
        self.write_frame(Frame::pong(payload)).await
    }

    /// Starts the closing handshake.
    ///
    /// Sends a close frame (an empty one for `None`) and stops accepting
    /// outgoing messages. The read loop keeps delivering what the peer sends
    /// until its close frame or the end of the stream arrives. A server also
    /// shuts down its side of the stream right away. If the peer does not
    /// answer within [`WebSocketConfig::close_timeout`], the read loop gives up
    /// with [`std::io::ErrorKind::TimedOut`]. Closing twice is a no-op.
    pub async fn close(&self, frame: Option<CloseFrame>) -> Result<()> {
        match self.state.get() {
            SessionState::Open => self.state.set(SessionState::Closing),
            SessionState::Closing => return Ok(()),
            SessionState::Closed => return Err(Error::AlreadyClosed),
        }
        debug!(session = self.id, close = ?frame, "closing handshake started");

        self.write_frame(Frame::close(frame)).await?;

        if self.role == Role::Server {
            // The underlying TCP connection, in most normal cases, SHOULD be closed
            // first by the server. (RFC 6455)
            let mut writer = self.writer.lock().await;
            if let Some(writer) = writer.as_mut() {
                with_deadline(self.config.write_timeout, writer.get_mut().shutdown()).await?;
            }
        }
        let _ = self.interrupts.unbounded_send(Interrupt::Closing);
        Ok(())
    }

    /// Encodes one frame and writes it out under the write lock.
    ///
    /// A failed write may leave part of a frame on the wire, so the stream is
    /// dropped and the read loop interrupted.
    async fn write_frame(&self, mut frame: Frame) -> Result<()> {
        if self.role == Role::Client {
            // If the data is being sent by the client, the frame(s) MUST be
            // masked as defined in Section 5.3. (RFC 6455)
            frame.set_random_mask();
        }
        trace!(
            session = self.id,
            opcode = %frame.header().opcode,
            len = frame.payload().len(),
            "sending frame"
        );

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::AlreadyClosed)?;
        let res = with_deadline(self.config.write_timeout, async {
            Sink::send(&mut *writer, frame).await?;
            Sink::<Frame>::flush(writer).await
        })
        .await;

        if let Err(ref err) = res {
            debug!(session = self.id, error = %err, "write failed, dropping the stream");
            if self.state.get() == SessionState::Open {
                self.state.set(SessionState::Closing);
            }
            if let Some(mut writer) = guard.take() {
                let shutdown = writer.get_mut().shutdown();
                if let Err(err) = with_deadline(self.config.write_timeout, shutdown).await {
                    trace!(session = self.id, error = %err, "failed to shut down stream");
                }
            }
            let kind = match err {
                Error::Io(err) => err.kind(),
                _ => io::ErrorKind::BrokenPipe,
            };
            let _ = self.interrupts.unbounded_send(Interrupt::WriteFailed(kind));
        }
        res
    }

    /// Drives the session until the connection ends.
    ///
    /// Decodes frames from `reader`, answers pings, reassembles fragmented
    /// messages for [`Handler::on_message`] and completes the closing
    /// handshake. Whatever ends the loop (a close frame, a protocol violation,
    /// an I/O error or the end of the stream), the write half is then shut
    /// down and released, the state becomes [`SessionState::Closed`] and
    /// [`Handler::on_disconnect`] fires once.
    ///
    /// Returns `Ok(())` for a completed closing handshake and the terminating
    /// error otherwise.
    pub async fn run<R, H>(self: Rc<Self>, mut reader: FrameReader<R>, handler: &H) -> Result<()>
    where
        R: AsyncReadRent,
        H: Handler<W> + ?Sized,
    {
        let res = Self::read_loop(&self, &mut reader, handler).await;

        if let Err(ref err) = res {
            debug!(session = self.id, error = %err, "session terminated");
            self.fail(err).await;
        }

        drop(reader);
        self.release().await;
        if !self.disconnected.replace(true) {
            handler.on_disconnect(&self).await;
        }

        match res {
            Err(Error::ConnectionClosed) => Ok(()),
            res => res,
        }
    }

    async fn read_loop<R, H>(
        session: &Rc<Self>,
        reader: &mut FrameReader<R>,
        handler: &H,
    ) -> Result<()>
    where
        R: AsyncReadRent,
        H: Handler<W> + ?Sized,
    {
        loop {
            let Some(frame) = reader.next_frame().await? else {
                // Connection closed by peer
                return match session.state.get() {
                    SessionState::Open => {
                        Err(Error::Protocol(ProtocolError::ResetWithoutClosingHandshake))
                    }
                    _ => Err(Error::ConnectionClosed),
                };
            };

            trace!(
                session = session.id,
                opcode = %frame.header().opcode,
                fin = frame.header().is_final,
                len = frame.payload().len(),
                "received frame"
            );

            // MUST be 0 unless an extension is negotiated that defines meanings
            // for non-zero values. (RFC 6455)
            {
                let hdr = frame.header();
                if hdr.rsv1 || hdr.rsv2 || hdr.rsv3 {
                    return Err(Error::Protocol(ProtocolError::NonZeroReservedBits));
                }
            }

            match frame.header().opcode {
                OpCode::Control(ctl) => {
                    // All control frames MUST have a payload length of 125 bytes or less
                    // and MUST NOT be fragmented. (RFC 6455)
                    if !frame.header().is_final {
                        return Err(Error::Protocol(ProtocolError::FragmentedControlFrame));
                    }
                    if frame.payload().len() > MAX_CONTROL_PAYLOAD {
                        return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
                    }

                    match ctl {
                        OpCtl::Close => {
                            let close = frame.into_close()?;
                            debug!(session = session.id, close = ?close, "received close frame");
                            if session.state.get() == SessionState::Open {
                                session.state.set(SessionState::Closing);
                                session.write_frame(Frame::close(close.map(echo_close))).await?;
                            }
                            return Err(Error::ConnectionClosed);
                        }
                        OpCtl::Ping => {
                            // No ping processing after we sent a close frame.
                            if session.state.get() == SessionState::Open {
                                session.write_frame(Frame::pong(frame.into_payload())).await?;
                            }
                        }
                        OpCtl::Pong => {
                            trace!(session = session.id, "received pong");
                        }
                        OpCtl::Reserved(i) => {
                            return Err(Error::Protocol(ProtocolError::UnknownControlFrameType(i)));
                        }
                    }
                }

                OpCode::Data(data) => {
                    if let Some(message) = reader.push_data(data, frame)? {
                        handler.on_message(session, message).await;
                    }
                }
            }
        }
    }

    /// Tells the peer why we give up on a connection that is still open.
    async fn fail(&self, err: &Error) {
        let code = match err {
            Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => return,
            Error::Protocol(_) => CloseCode::Protocol,
            Error::Capacity(_) => CloseCode::Size,
            Error::Utf8(_) => CloseCode::Invalid,
            _ => return,
        };
        if self.state.get() != SessionState::Open {
            return;
        }
        self.state.set(SessionState::Closing);

        let close = CloseFrame {
            code,
            reason: Utf8Bytes::from_static(""),
        };
        if let Err(err) = self.write_frame(Frame::close(Some(close))).await {
            trace!(session = self.id, error = %err, "failed to send close frame");
        }
    }

    /// Shuts down and drops the write half. Later sends report [`Error::AlreadyClosed`].
    async fn release(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let res = with_deadline(self.config.write_timeout, Sink::<Frame>::close(&mut writer));
            if let Err(err) = res.await {
                trace!(session = self.id, error = %err, "failed to shut down stream");
            }
        }
        self.state.set(SessionState::Closed);
        debug!(session = self.id, "session closed");
    }
}

/// Close frames with codes that must not appear on the wire are answered with a protocol error.
fn echo_close(frame: CloseFrame) -> CloseFrame {
    if frame.code.is_allowed() {
        frame
    } else {
        CloseFrame {
            code: CloseCode::Protocol,
            reason: Utf8Bytes::from_static("Protocol violation"),
        }
    }
}

/// Read half of a session: decodes frames and reassembles fragmented messages.
#[derive(Debug)]
pub struct FrameReader<R> {
    framed: FramedRead<R, FrameDecoder>,
    /// Receive: an incomplete message being processed.
    incomplete: Option<IncompleteMessage>,
    max_message_size: Option<usize>,
    read_timeout: Option<Duration>,
    close_timeout: Option<Duration>,
    interrupts: Option<UnboundedReceiver<Interrupt>>,
    close_deadline: Option<Instant>,
}

impl<R> FrameReader<R> {
    /// Creates a reader for the given side of the connection.
    pub fn new(io: R, role: Role, config: &WebSocketConfig) -> Self {
        let decoder = FrameDecoder::new(
            role,
            config.max_frame_size,
            config.accept_unmasked_frames,
        );
        Self {
            framed: FramedRead::with_capacity(io, decoder, config.initial_read_capacity),
            incomplete: None,
            max_message_size: config.max_message_size,
            read_timeout: config.read_timeout,
            close_timeout: config.close_timeout,
            interrupts: None,
            close_deadline: None,
        }
    }

    /// Returns a reference to the underlying stream.
    pub fn get_ref(&self) -> &R {
        self.framed.get_ref()
    }

    /// Reads the next whole frame. `None` means the peer closed the stream.
    ///
    /// A reader built with its session also stops when a write fails or the
    /// peer leaves our close frame unanswered for too long.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>>
    where
        R: AsyncReadRent,
    {
        let Self {
            framed,
            read_timeout,
            close_timeout,
            interrupts,
            close_deadline,
            ..
        } = self;

        let read = pin!(with_deadline(*read_timeout, async { framed.next().await.transpose() }));
        let interrupted = pin!(wait_interrupt(interrupts.as_mut(), close_deadline, *close_timeout));
        match future::select(read, interrupted).await {
            Either::Left((res, _)) => res,
            Either::Right((err, _)) => Err(err),
        }
    }

    /// Feeds a data frame into reassembly and returns the message it completes.
    fn push_data(&mut self, data: OpData, frame: Frame) -> Result<Option<Message>> {
        let fin = frame.header().is_final;

        match data {
            OpData::Continue => {
                let Some(mut msg) = self.incomplete.take() else {
                    return Err(Error::Protocol(ProtocolError::UnexpectedContinueFrame));
                };
                msg.extend(frame.into_payload(), self.max_message_size)?;

                if fin {
                    Ok(Some(msg.complete()?))
                } else {
                    self.incomplete = Some(msg);
                    Ok(None)
                }
            }

            c if self.incomplete.is_some() => {
                Err(Error::Protocol(ProtocolError::ExpectedFragment(c)))
            }

            OpData::Text | OpData::Binary => {
                let message_type = if data == OpData::Text {
                    IncompleteMessageType::Text
                } else {
                    IncompleteMessageType::Binary
                };

                let mut incomplete = IncompleteMessage::new(message_type);
                incomplete.extend(frame.into_payload(), self.max_message_size)?;

                if fin {
                    Ok(Some(incomplete.complete()?))
                } else {
                    self.incomplete = Some(incomplete);
                    Ok(None)
                }
            }

            OpData::Reserved(i) => Err(Error::Protocol(ProtocolError::UnknownDataFrameType(i))),
        }
    }
}

/// Resolves once the session asks its read loop to stop.
async fn wait_interrupt(
    interrupts: Option<&mut UnboundedReceiver<Interrupt>>,
    close_deadline: &mut Option<Instant>,
    close_timeout: Option<Duration>,
) -> Error {
    let Some(interrupts) = interrupts else {
        return future::pending().await;
    };
    loop {
        if let Some(deadline) = *close_deadline {
            monoio::time::sleep(deadline.saturating_duration_since(Instant::now())).await;
            return Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "peer did not answer the close frame",
            ));
        }
        match interrupts.next().await {
            Some(Interrupt::Closing) => {
                if let Some(timeout) = close_timeout {
                    *close_deadline = Some(Instant::now() + timeout);
                }
            }
            Some(Interrupt::WriteFailed(kind)) => {
                return Error::Io(io::Error::new(kind, "stream failed while writing"));
            }
            None => return future::pending().await,
        }
    }
}

impl<R> FrameReader<R> {
    #[doc(hidden)]
    pub fn read_buffer(&self) -> &BytesMut {
        self.framed.read_buffer()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, io};

    use monoio::{
        BufResult,
        buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    };
    use monoio_codec::{Decoded, Decoder};

    use super::*;
    use crate::error::CapacityError;

    /// Records everything written to it.
    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<u8>>>);

    impl AsyncWriteRent for Recorder {
        async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
            let len = buf.bytes_init();
            let data = unsafe { std::slice::from_raw_parts(buf.read_ptr(), len) };
            self.0.borrow_mut().extend_from_slice(data);
            (Ok(len), buf)
        }

        async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
            (Ok(buf_vec.read_iovec_len()), buf_vec)
        }

        async fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn shutdown(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Accepts at most three bytes per write and yields in between.
    #[derive(Clone, Default)]
    struct Trickle(Rc<RefCell<Vec<u8>>>);

    impl AsyncWriteRent for Trickle {
        async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
            monoio::time::sleep(Duration::from_millis(1)).await;
            let len = buf.bytes_init().min(3);
            let data = unsafe { std::slice::from_raw_parts(buf.read_ptr(), len) };
            self.0.borrow_mut().extend_from_slice(data);
            (Ok(len), buf)
        }

        async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
            (Ok(buf_vec.read_iovec_len()), buf_vec)
        }

        async fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn shutdown(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Takes three bytes, then fails once with `BrokenPipe`, then accepts everything.
    #[derive(Clone, Default)]
    struct Flaky {
        wire: Rc<RefCell<Vec<u8>>>,
        writes: Rc<Cell<usize>>,
    }

    impl AsyncWriteRent for Flaky {
        async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
            let n = self.writes.get();
            self.writes.set(n + 1);
            let len = match n {
                0 => buf.bytes_init().min(3),
                1 => return (Err(io::Error::from(io::ErrorKind::BrokenPipe)), buf),
                _ => buf.bytes_init(),
            };
            let data = unsafe { std::slice::from_raw_parts(buf.read_ptr(), len) };
            self.wire.borrow_mut().extend_from_slice(data);
            (Ok(len), buf)
        }

        async fn writev<T: IoVecBuf>(&mut self, buf_vec: T) -> BufResult<usize, T> {
            (Ok(buf_vec.read_iovec_len()), buf_vec)
        }

        async fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }

        async fn shutdown(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// A peer that never sends anything.
    struct Silent;

    impl AsyncReadRent for Silent {
        async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
            std::future::pending::<()>().await;
            (Ok(0), buf)
        }

        async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
            std::future::pending::<()>().await;
            (Ok(0), buf)
        }
    }

    struct BrokenRead;

    impl AsyncReadRent for BrokenRead {
        async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
            (Err(io::Error::new(io::ErrorKind::ConnectionReset, "boom")), buf)
        }

        async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
            (Err(io::Error::new(io::ErrorKind::ConnectionReset, "boom")), buf)
        }
    }

    #[derive(Default)]
    struct Collect {
        connects: Cell<usize>,
        messages: RefCell<Vec<Message>>,
        disconnects: Cell<usize>,
    }

    impl<W> Handler<W> for Collect {
        async fn on_connect(&self, _session: &Rc<Session<W>>) {
            self.connects.set(self.connects.get() + 1);
        }

        async fn on_message(&self, _session: &Rc<Session<W>>, message: Message) {
            self.messages.borrow_mut().push(message);
        }

        async fn on_disconnect(&self, session: &Rc<Session<W>>) {
            assert_eq!(session.state(), SessionState::Closed);
            self.disconnects.set(self.disconnects.get() + 1);
        }
    }

    /// Decodes everything a session wrote, as seen by its peer.
    fn written_frames(bytes: &[u8], peer: Role) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new(peer, None, false);
        let mut src = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Decoded::Some(frame) = decoder.decode(&mut src).unwrap() {
            frames.push(frame);
        }
        assert!(src.is_empty(), "trailing bytes after last frame");
        frames
    }

    #[monoio::test]
    async fn ping_is_answered_with_one_pong() {
        let incoming = [0x89, 0x02, 0x01, 0x02, 0x88, 0x00];
        let out = Recorder::default();
        let (session, reader) =
            Session::from_raw_parts(&incoming[..], out.clone(), Role::Client, None);
        let handler = Collect::default();

        session.run(reader, &handler).await.unwrap();

        assert!(handler.messages.borrow().is_empty());
        assert_eq!(handler.disconnects.get(), 1);

        let frames = written_frames(&out.0.borrow(), Role::Server);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].header().opcode, OpCode::Control(OpCtl::Pong));
        assert_eq!(frames[0].payload(), &[0x01, 0x02]);
        // The close frame is echoed before the session ends.
        assert_eq!(frames[1].header().opcode, OpCode::Control(OpCtl::Close));
    }

    #[monoio::test]
    async fn fragments_are_reassembled() {
        let incoming = [
            0x02, 0x02, b'a', b'b', 0x00, 0x02, b'c', b'd', 0x80, 0x02, b'e', b'f', 0x88, 0x00,
        ];
        let (session, reader) =
            Session::from_raw_parts(&incoming[..], Recorder::default(), Role::Client, None);
        let handler = Collect::default();

        session.run(reader, &handler).await.unwrap();

        assert_eq!(
            *handler.messages.borrow(),
            vec![Message::binary(&b"abcdef"[..])]
        );
    }

    #[monoio::test]
    async fn messages_keep_wire_order() {
        let incoming = [
            0x81, 0x01, b'1', 0x01, 0x01, b'2', 0x8a, 0x00, 0x80, 0x01, b'3', 0x82, 0x01, b'4',
            0x88, 0x00,
        ];
        let (session, reader) =
            Session::from_raw_parts(&incoming[..], Recorder::default(), Role::Client, None);
        let handler = Collect::default();

        session.run(reader, &handler).await.unwrap();

        assert_eq!(
            *handler.messages.borrow(),
            vec![
                Message::text("1"),
                Message::text("23"),
                Message::binary(&b"4"[..])
            ]
        );
    }

    #[monoio::test]
    async fn server_rejects_unmasked_frames() {
        let incoming = [0x81, 0x02, b'h', b'i'];
        let out = Recorder::default();
        let (session, reader) =
            Session::from_raw_parts(&incoming[..], out.clone(), Role::Server, None);
        let handler = Collect::default();

        let err = session.clone().run(reader, &handler).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnmaskedFrameFromClient)
        ));
        assert!(handler.messages.borrow().is_empty());
        assert_eq!(handler.disconnects.get(), 1);
        assert_eq!(session.state(), SessionState::Closed);
        // 1002 protocol error, unmasked because we are the server.
        assert_eq!(*out.0.borrow(), vec![0x88, 0x02, 0x03, 0xEA]);
    }

    #[monoio::test]
    async fn client_rejects_masked_frames() {
        let incoming = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let (session, reader) =
            Session::from_raw_parts(&incoming[..], Recorder::default(), Role::Client, None);
        let handler = Collect::default();

        let err = session.run(reader, &handler).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::MaskedFrameFromServer)
        ));
        assert_eq!(handler.disconnects.get(), 1);
    }

    #[monoio::test]
    async fn end_of_stream_without_close() {
        let incoming = [0x81, 0x02, b'h', b'i'];
        let out = Recorder::default();
        let (session, reader) =
            Session::from_raw_parts(&incoming[..], out.clone(), Role::Client, None);
        let handler = Collect::default();

        let err = session.run(reader, &handler).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)
        ));
        assert_eq!(*handler.messages.borrow(), vec![Message::text("hi")]);
        assert_eq!(handler.disconnects.get(), 1);
        assert!(out.0.borrow().is_empty());
    }

    #[monoio::test]
    async fn io_error_ends_the_session() {
        let (session, reader) =
            Session::from_raw_parts(BrokenRead, Recorder::default(), Role::Server, None);
        let handler = Collect::default();

        let err = session.clone().run(reader, &handler).await.unwrap_err();

        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::ConnectionReset));
        assert_eq!(handler.disconnects.get(), 1);
        assert!(matches!(
            session.send("late").await,
            Err(Error::AlreadyClosed)
        ));
    }

    #[monoio::test]
    async fn oversized_message_is_rejected() {
        let incoming = [
            0x01, 0x07, 0x48, 0x65, 0x6c, 0x6c, 0x6f, 0x2c, 0x20, 0x80, 0x06, 0x57, 0x6f, 0x72,
            0x6c, 0x64, 0x21,
        ];
        let limit = WebSocketConfig::default().max_message_size(Some(10));
        let (session, reader) = Session::from_raw_parts(
            &incoming[..],
            Recorder::default(),
            Role::Client,
            Some(limit),
        );

        let err = session.run(reader, &()).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Capacity(CapacityError::MessageTooLong {
                size: 13,
                max_size: 10
            })
        ));
    }

    #[monoio::test]
    async fn control_frame_rules() {
        // Fragmented ping.
        let incoming = [0x09, 0x00];
        let (session, reader) =
            Session::from_raw_parts(&incoming[..], Recorder::default(), Role::Client, None);
        assert!(matches!(
            session.run(reader, &()).await,
            Err(Error::Protocol(ProtocolError::FragmentedControlFrame))
        ));

        // Reserved bit set.
        let incoming = [0xC1, 0x00];
        let (session, reader) =
            Session::from_raw_parts(&incoming[..], Recorder::default(), Role::Client, None);
        assert!(matches!(
            session.run(reader, &()).await,
            Err(Error::Protocol(ProtocolError::NonZeroReservedBits))
        ));

        // Continuation without a message in progress.
        let incoming = [0x80, 0x00];
        let (session, reader) =
            Session::from_raw_parts(&incoming[..], Recorder::default(), Role::Client, None);
        assert!(matches!(
            session.run(reader, &()).await,
            Err(Error::Protocol(ProtocolError::UnexpectedContinueFrame))
        ));
    }

    #[monoio::test]
    async fn close_with_reserved_code_is_answered_with_protocol_error() {
        // Code 1005 must never be sent on the wire.
        let incoming = [0x88, 0x02, 0x03, 0xED];
        let out = Recorder::default();
        let config = WebSocketConfig::default().accept_unmasked_frames(true);
        let (session, reader) =
            Session::from_raw_parts(&incoming[..], out.clone(), Role::Server, Some(config));

        session.run(reader, &()).await.unwrap();

        let frames = written_frames(&out.0.borrow(), Role::Client);
        let close = frames[0].clone().into_close().unwrap().unwrap();
        assert_eq!(close.code, CloseCode::Protocol);
    }

    #[monoio::test]
    async fn send_uses_text_and_binary_frames() {
        let out = Recorder::default();
        let (session, _reader) =
            Session::from_raw_parts(&b""[..], out.clone(), Role::Server, None);

        session.send("hi").await.unwrap();
        session.send(vec![1u8, 2, 3]).await.unwrap();

        assert_eq!(
            *out.0.borrow(),
            vec![0x81, 0x02, b'h', b'i', 0x82, 0x03, 0x01, 0x02, 0x03]
        );
    }

    #[monoio::test]
    async fn client_sends_are_masked() {
        let out = Recorder::default();
        let (session, _reader) =
            Session::from_raw_parts(&b""[..], out.clone(), Role::Client, None);

        let long = "x".repeat(300);
        session.send(long.as_str()).await.unwrap();

        let written = out.0.borrow();
        assert_eq!(written[1], 0x80 | 126);
        let frames = written_frames(&written, Role::Server);
        assert_eq!(frames[0].payload(), long.as_bytes());
    }

    #[monoio::test]
    async fn sending_after_close() {
        let out = Recorder::default();
        let (session, _reader) =
            Session::from_raw_parts(&b""[..], out.clone(), Role::Server, None);

        session.close(None).await.unwrap();
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(*out.0.borrow(), vec![0x88, 0x00]);

        assert!(matches!(
            session.send("nope").await,
            Err(Error::Protocol(ProtocolError::SendAfterClosing))
        ));
        // A second close sends nothing.
        session.close(Some(CloseFrame::normal())).await.unwrap();
        assert_eq!(out.0.borrow().len(), 2);
    }

    #[monoio::test]
    async fn control_payload_limit() {
        let (session, _reader) =
            Session::from_raw_parts(&b""[..], Recorder::default(), Role::Server, None);
        assert!(matches!(
            session.ping(vec![0u8; 126]).await,
            Err(Error::Protocol(ProtocolError::ControlFrameTooBig))
        ));
        session.ping(vec![0u8; 125]).await.unwrap();
        session.pong(Bytes::new()).await.unwrap();
    }

    #[monoio::test(timer_enabled = true)]
    async fn initiated_close_ends_on_reply() {
        let incoming = [0x81, 0x02, b'h', b'i', 0x88, 0x02, 0x03, 0xE8];
        let out = Recorder::default();
        let (session, reader) =
            Session::from_raw_parts(&incoming[..], out.clone(), Role::Client, None);
        let handler = Collect::default();

        session.close(Some(CloseFrame::normal())).await.unwrap();
        session.clone().run(reader, &handler).await.unwrap();

        // Data that raced our close frame is still delivered.
        assert_eq!(*handler.messages.borrow(), vec![Message::text("hi")]);
        // Only our own close frame; the reply is not echoed again.
        assert_eq!(written_frames(&out.0.borrow(), Role::Server).len(), 1);
        assert_eq!(handler.disconnects.get(), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn concurrent_sends_do_not_interleave() {
        let out = Trickle::default();
        let (session, _reader) =
            Session::from_raw_parts(&b""[..], out.clone(), Role::Server, None);

        let a = monoio::spawn({
            let session = session.clone();
            async move { session.send("a".repeat(40)).await }
        });
        let b = monoio::spawn({
            let session = session.clone();
            async move { session.send(vec![7u8; 40]).await }
        });
        a.await.unwrap();
        b.await.unwrap();

        let frames = written_frames(&out.0.borrow(), Role::Client);
        assert_eq!(frames.len(), 2);
        for frame in frames {
            match frame.header().opcode {
                OpCode::Data(OpData::Text) => assert_eq!(frame.payload(), &[b'a'; 40]),
                OpCode::Data(OpData::Binary) => assert_eq!(frame.payload(), &[7u8; 40]),
                other => panic!("unexpected {other}"),
            }
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn read_deadline() {
        let config = WebSocketConfig::default().read_timeout(Some(Duration::from_millis(20)));
        let (session, reader) =
            Session::from_raw_parts(Silent, Recorder::default(), Role::Client, Some(config));
        let handler = Collect::default();

        let err = session.run(reader, &handler).await.unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::TimedOut));
        assert_eq!(handler.disconnects.get(), 1);
    }

    #[monoio::test]
    async fn failed_write_drops_the_stream() {
        let out = Flaky::default();
        let (session, reader) = Session::from_raw_parts(Silent, out.clone(), Role::Server, None);
        let handler = Collect::default();

        assert!(matches!(
            session.send("first").await,
            Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::BrokenPipe
        ));
        assert_eq!(session.state(), SessionState::Closing);

        // Nothing may follow the torn frame.
        assert!(session.send("second").await.is_err());
        assert!(session.ping(Bytes::new()).await.is_err());
        assert_eq!(*out.wire.borrow(), vec![0x81, 0x05, b'f']);

        // The read loop stops although the peer stays silent.
        let err = session.clone().run(reader, &handler).await.unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(handler.disconnects.get(), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn unanswered_close_times_out() {
        let out = Recorder::default();
        let config = WebSocketConfig::default().close_timeout(Some(Duration::from_millis(30)));
        let (session, reader) =
            Session::from_raw_parts(Silent, out.clone(), Role::Server, Some(config));
        let handler = Collect::default();

        session.close(None).await.unwrap();
        let res = monoio::time::timeout(
            Duration::from_millis(500),
            session.clone().run(reader, &handler),
        )
        .await
        .expect("read loop kept waiting for the close reply");

        assert!(matches!(res, Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::TimedOut));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(handler.disconnects.get(), 1);
        assert_eq!(*out.0.borrow(), vec![0x88, 0x00]);
    }

    #[monoio::test(timer_enabled = true)]
    async fn close_interrupts_a_pending_read() {
        let config = WebSocketConfig::default().close_timeout(Some(Duration::from_millis(30)));
        let (session, reader) =
            Session::from_raw_parts(Silent, Recorder::default(), Role::Client, Some(config));

        let task = monoio::spawn({
            let session = session.clone();
            async move { session.run(reader, &()).await }
        });
        monoio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(session.state(), SessionState::Open);

        session.close(Some(CloseFrame::normal())).await.unwrap();
        let res = monoio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("read loop kept waiting for the close reply");
        assert!(matches!(res, Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::TimedOut));
        assert_eq!(session.state(), SessionState::Closed);
    }
}
