use crate::{part::PartHead, Error, FormFieldPart};
use bytes::Bytes;
use futures::{stream::BoxStream, Stream, StreamExt};
use std::{
    collections::VecDeque,
    fmt,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

/// What the decoder hands out when asked for the next part.
pub(crate) enum NextPart {
    Field(FormFieldPart),
    File { head: PartHead, seq: u64 },
}

/// Decoding state of one message, shared by the part stream and the body of
/// the file part currently being read.
pub(crate) trait PartSource: Send {
    fn poll_next_part(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<NextPart, Error>>>;

    fn poll_file_chunk(&mut self, seq: u64, cx: &mut Context<'_>)
        -> Poll<Option<Result<Bytes, Error>>>;
}

pub(crate) type SharedSource = Arc<Mutex<dyn PartSource>>;

pub(crate) fn lock(source: &SharedSource) -> MutexGuard<'_, dyn PartSource + 'static> {
    source.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The lazy body of a [`FilePart`](crate::FilePart).
///
/// Yields the body in order as it arrives from the request. It is single
/// pass: once the message moves on to the next part, an unfinished body
/// reports [`Error::BodySkipped`]. Bodies collected by
/// [`Multipart::to_map`](crate::Multipart::to_map) are replayed from memory
/// or, past the spool threshold, from a temp file.
pub struct FileBody {
    inner: Inner,
}

enum Inner {
    Streaming { source: SharedSource, seq: u64 },
    Buffered(VecDeque<Bytes>),
    Spooled(BoxStream<'static, Result<Bytes, Error>>),
    Finished,
}

impl FileBody {
    pub(crate) fn streaming(source: SharedSource, seq: u64) -> Self {
        Self {
            inner: Inner::Streaming { source, seq },
        }
    }

    pub(crate) fn buffered(chunks: VecDeque<Bytes>) -> Self {
        Self {
            inner: Inner::Buffered(chunks),
        }
    }

    pub(crate) fn spooled(chunks: BoxStream<'static, Result<Bytes, Error>>) -> Self {
        Self {
            inner: Inner::Spooled(chunks),
        }
    }

    /// True when the body is held in memory rather than read from the request.
    pub fn is_buffered(&self) -> bool {
        matches!(self.inner, Inner::Buffered(_))
    }

    /// True when the body was parked in a temp file by
    /// [`Multipart::to_map`](crate::Multipart::to_map) and friends.
    pub fn is_spooled(&self) -> bool {
        matches!(self.inner, Inner::Spooled(_))
    }
}

impl fmt::Debug for FileBody {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match self.inner {
            Inner::Streaming { seq, .. } => format!("streaming #{}", seq),
            Inner::Buffered(ref chunks) => format!("buffered ({} chunks)", chunks.len()),
            Inner::Spooled(_) => "spooled".to_owned(),
            Inner::Finished => "finished".to_owned(),
        };
        f.debug_struct("FileBody").field("state", &state).finish()
    }
}

impl Stream for FileBody {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        let polled = match this.inner {
            Inner::Streaming { ref source, seq } => lock(source).poll_file_chunk(seq, cx),
            Inner::Buffered(ref mut chunks) => Poll::Ready(chunks.pop_front().map(Ok)),
            Inner::Spooled(ref mut chunks) => chunks.poll_next_unpin(cx),
            Inner::Finished => return Poll::Ready(None),
        };

        if let Poll::Ready(None) | Poll::Ready(Some(Err(_))) = polled {
            this.inner = Inner::Finished;
        }

        polled
    }
}
