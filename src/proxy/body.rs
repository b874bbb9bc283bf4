//! Buffered-vs-streaming body handling.
//!
//! Bodies up to the configured threshold are buffered into memory so the
//! `request`/`response` hooks can see and edit them. Anything larger flips
//! the flow into streaming mode: the bytes already read become the head of a
//! reader that continues from the wire, and the buffered hooks are skipped
//! for that direction.
//!
//! Two adapters bridge hyper bodies and `AsyncRead`, which is the currency
//! of the stream modifier chain: [`BodyToReader`] turns an incoming hyper
//! body into a reader, and [`reader_body`] turns a reader back into a body
//! for sending.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Boxed reader used for streaming bodies through the modifier chain.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin + 'static>;

/// Body type used for every response the proxy writes and every request it
/// forwards. Unsync: streamed bodies wrap readers that only promise `Send`.
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// An empty body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(io::Error::other)
        .boxed_unsync()
}

/// A body holding the given bytes.
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(io::Error::other)
        .boxed_unsync()
}

/// A chunked body draining the given reader.
pub fn reader_body(reader: BodyReader) -> ProxyBody {
    ReaderFrames {
        reader,
        buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
    }
    .boxed_unsync()
}

const READ_CHUNK: usize = 8 * 1024;

/// `AsyncRead` over a hyper body. Trailers are discarded.
pub struct BodyToReader<B> {
    body: B,
    pending: Bytes,
}

impl<B> BodyToReader<B> {
    /// Wraps a body.
    pub fn new(body: B) -> Self {
        Self {
            body,
            pending: Bytes::new(),
        }
    }
}

impl<B> AsyncRead for BodyToReader<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            if !me.pending.is_empty() {
                let n = me.pending.len().min(buf.remaining());
                buf.put_slice(&me.pending[..n]);
                me.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            match Pin::new(&mut me.body).poll_frame(cx) {
                Poll::Ready(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        me.pending = data;
                    }
                }
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(io::Error::other(err))),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

struct ReaderFrames {
    reader: BodyReader,
    buf: Box<[u8]>,
}

impl Body for ReaderFrames {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        let me = self.get_mut();
        let mut read_buf = ReadBuf::new(&mut me.buf);
        match Pin::new(&mut me.reader).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                if filled.is_empty() {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Ok(Frame::data(Bytes::copy_from_slice(filled)))))
                }
            }
            Poll::Ready(Err(err)) => Poll::Ready(Some(Err(err))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Outcome of reading a body against the streaming threshold.
pub enum GatedBody {
    /// The body fit within the threshold.
    Buffered(Bytes),
    /// The body exceeded the threshold; the reader replays the buffered head
    /// and continues from the wire.
    Streaming(BodyReader),
}

/// Reads `body` until EOF or until more than `limit` bytes have arrived.
pub async fn gate_body<B>(body: B, limit: usize) -> io::Result<GatedBody>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let mut reader = BodyToReader::new(body);
    let mut buffered: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(GatedBody::Buffered(Bytes::from(buffered)));
        }
        buffered.extend_from_slice(&chunk[..n]);
        if buffered.len() > limit {
            let head = io::Cursor::new(buffered);
            return Ok(GatedBody::Streaming(Box::new(tokio::io::AsyncReadExt::chain(
                head, reader,
            ))));
        }
    }
}

/// Reads a modifier-chain output back into memory. Used in buffered mode so
/// the outbound request keeps an exact `Content-Length`.
pub async fn drain_reader(mut reader: BodyReader) -> io::Result<Bytes> {
    let mut out = Vec::new();
    reader.read_to_end(&mut out).await?;
    Ok(Bytes::from(out))
}
