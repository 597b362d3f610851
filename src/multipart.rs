use crate::{
    assembler::{Assembled, PartAssembler},
    body::{lock, NextPart, PartSource, SharedSource},
    parser::{BoundaryParser, Event, ParseResult},
    BlockingPool, Config, Error, FileBody, FilePart, Part,
};
use bytes::Bytes;
use futures::{ready, Stream, TryStreamExt};
use std::{
    collections::HashMap,
    fmt,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

pub trait MultipartRequest
where
    Self: Sized,
{
    fn into_multipart_with_config(self, config: Config) -> Result<Multipart, Error>;

    fn into_multipart(self) -> Result<Multipart, Error> {
        self.into_multipart_with_config(Config::default())
    }
}

impl MultipartRequest for hyper::Request<hyper::Body> {
    fn into_multipart_with_config(self, config: Config) -> Result<Multipart, Error> {
        let (parts, body) = self.into_parts();
        crate::from_headers_with_config(&parts.headers, body, config)
    }
}

/// The parts of one `multipart/form-data` body, in the order they were sent.
///
/// Used as a stream, parts are produced lazily and the body of a
/// [`FilePart`] has to be read before asking for the next part; whatever is
/// left of it is discarded when the stream moves on.
///
/// The first error ends the stream. No part after a decode error is
/// produced and the request body is dropped.
pub struct Multipart {
    source: SharedSource,
    pool: BlockingPool,
    spool_threshold: usize,
    max_file_bytes: Option<usize>,
}

impl Multipart {
    pub fn new<S, I, E, B>(stream: S, boundary: B, config: Config) -> Self
    where
        S: Stream<Item = Result<I, E>> + Unpin + Send + 'static,
        I: AsRef<[u8]>,
        E: fmt::Display,
        B: AsRef<str>,
    {
        let decoder = Decoder {
            stream: Some(stream),
            parser: BoundaryParser::new(boundary, config.buffer_capacity, config.max_header_bytes),
            assembler: PartAssembler::new(&config),
            active_file: None,
            next_seq: 0,
            status: Status::Running,
        };

        let source: SharedSource = Arc::new(Mutex::new(decoder));

        Self {
            source,
            pool: config.blocking,
            spool_threshold: config.spool_threshold,
            max_file_bytes: config.max_file_bytes,
        }
    }

    pub fn blocking_pool(&self) -> &BlockingPool {
        &self.pool
    }

    /// Reads the whole message into a map from field name to part.
    ///
    /// File bodies are kept so they can be read afterwards: in memory up to
    /// the spool threshold, in a temp file beyond it. When a name repeats,
    /// the last part with that name wins.
    pub async fn to_map(mut self) -> Result<HashMap<String, Part>, Error> {
        let mut map = HashMap::new();
        while let Some(part) = self.next_buffered().await? {
            if let Some(prev) = map.insert(part.name().to_owned(), part) {
                log::debug!("Duplicate part {:?} replaced", prev.name());
            }
        }
        Ok(map)
    }

    /// Like [`to_map`](Multipart::to_map) but keeps every part of a name, in order.
    pub async fn to_multi_map(mut self) -> Result<HashMap<String, Vec<Part>>, Error> {
        let mut map: HashMap<String, Vec<Part>> = HashMap::new();
        while let Some(part) = self.next_buffered().await? {
            map.entry(part.name().to_owned()).or_default().push(part);
        }
        Ok(map)
    }

    /// Collects every part in order, keeping file bodies like `to_map`.
    pub async fn collect_parts(mut self) -> Result<Vec<Part>, Error> {
        let mut parts = Vec::new();
        while let Some(part) = self.next_buffered().await? {
            parts.push(part);
        }
        Ok(parts)
    }

    async fn next_buffered(&mut self) -> Result<Option<Part>, Error> {
        match self.try_next().await? {
            Some(Part::File(file)) => {
                let file = file.buffer(self.spool_threshold, self.max_file_bytes).await?;
                Ok(Some(Part::File(file)))
            }
            other => Ok(other),
        }
    }
}

impl fmt::Debug for Multipart {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Multipart").finish()
    }
}

impl Stream for Multipart {
    type Item = Result<Part, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let next = ready!(lock(&this.source).poll_next_part(cx));

        let part = next.map(|res| {
            res.map(|next| match next {
                NextPart::Field(field) => Part::Field(field),
                NextPart::File { head, seq } => {
                    let body = FileBody::streaming(Arc::clone(&this.source), seq);
                    Part::File(FilePart::new(head, body, this.pool.clone()))
                }
            })
        });

        Poll::Ready(part)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    Finished,
    Failed,
}

/// Pulls chunks from the request body only when a consumer asks for a
/// part or for file bytes.
struct Decoder<S> {
    stream: Option<S>,
    parser: BoundaryParser,
    assembler: PartAssembler,
    active_file: Option<u64>,
    next_seq: u64,
    status: Status,
}

impl<S, I, E> Decoder<S>
where
    S: Stream<Item = Result<I, E>> + Unpin,
    I: AsRef<[u8]>,
    E: fmt::Display,
{
    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Result<Event, Error>> {
        loop {
            match self.parser.parse() {
                ParseResult::Ready(event) => return Poll::Ready(Ok(event)),
                ParseResult::Err(e) => return Poll::Ready(Err(e)),
                ParseResult::NotReady => {}
            }

            let stream = match self.stream.as_mut() {
                Some(stream) => stream,
                None => return Poll::Ready(Err(Error::malformed("body already consumed"))),
            };

            match ready!(Pin::new(stream).poll_next(cx)) {
                Some(Ok(chunk)) => self.parser.feed(chunk),
                Some(Err(e)) => return Poll::Ready(Err(Error::inner(e))),
                None => {
                    self.stream = None;
                    self.parser.end_of_input();
                }
            }
        }
    }

    fn fail(&mut self, e: Error) -> Error {
        log::warn!("Aborting multipart message: {}", e);
        self.status = Status::Failed;
        self.active_file = None;
        self.stream = None;
        e
    }

    fn finish(&mut self) {
        log::debug!("Multipart message complete");
        self.status = Status::Finished;
        self.stream = None;
    }
}

impl<S, I, E> PartSource for Decoder<S>
where
    S: Stream<Item = Result<I, E>> + Unpin + Send,
    I: AsRef<[u8]>,
    E: fmt::Display,
{
    fn poll_next_part(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<NextPart, Error>>> {
        if self.status != Status::Running {
            return Poll::Ready(None);
        }

        if let Some(seq) = self.active_file.take() {
            log::debug!("Discarding the unread rest of file part #{}", seq);
        }

        loop {
            let event = match ready!(self.poll_event(cx)) {
                Ok(event) => event,
                Err(e) => return Poll::Ready(Some(Err(self.fail(e)))),
            };

            match self.assembler.push(event) {
                Err(e) => return Poll::Ready(Some(Err(self.fail(e)))),
                Ok(Assembled::Incomplete) | Ok(Assembled::FileEnd) => {}
                Ok(Assembled::FileChunk(chunk)) => {
                    log::trace!("Skipped {} bytes of file body", chunk.len());
                }
                Ok(Assembled::Field(field)) => {
                    return Poll::Ready(Some(Ok(NextPart::Field(field))));
                }
                Ok(Assembled::File(head)) => {
                    let seq = self.next_seq;
                    self.next_seq += 1;
                    self.active_file = Some(seq);
                    return Poll::Ready(Some(Ok(NextPart::File { head, seq })));
                }
                Ok(Assembled::End) => {
                    self.finish();
                    return Poll::Ready(None);
                }
            }
        }
    }

    fn poll_file_chunk(
        &mut self,
        seq: u64,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Error>>> {
        if self.status == Status::Failed {
            return Poll::Ready(Some(Err(Error::Aborted)));
        }
        if self.active_file != Some(seq) {
            return Poll::Ready(Some(Err(Error::BodySkipped)));
        }

        loop {
            let event = match ready!(self.poll_event(cx)) {
                Ok(event) => event,
                Err(e) => return Poll::Ready(Some(Err(self.fail(e)))),
            };

            match self.assembler.push(event) {
                Ok(Assembled::FileChunk(chunk)) => return Poll::Ready(Some(Ok(chunk))),
                Ok(Assembled::FileEnd) => {
                    self.active_file = None;
                    return Poll::Ready(None);
                }
                Ok(Assembled::Incomplete) => {}
                Ok(other) => {
                    let e = Error::malformed(format!("file body interrupted by {:?}", other));
                    return Poll::Ready(Some(Err(self.fail(e))));
                }
                Err(e) => return Poll::Ready(Some(Err(self.fail(e)))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::{
        convert::Infallible,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    const BOUNDARY: &str = "1a2b3c";

    fn encode(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, filename, content) in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match filename {
                Some(filename) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n",
                        name, filename
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                        .as_bytes(),
                ),
            }
            body.extend_from_slice(content);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn multipart(body: &[u8], chunk_size: usize) -> Multipart {
        let chunks: Vec<Result<Vec<u8>, Infallible>> =
            body.chunks(chunk_size).map(|c| Ok(c.to_vec())).collect();
        Multipart::new(stream::iter(chunks), BOUNDARY, Config::default())
    }

    /// (name, filename, content) of every part, file bodies drained in turn.
    async fn summarize(mut m: Multipart) -> Result<Vec<(String, Option<String>, Vec<u8>)>, Error> {
        let mut out = Vec::new();
        while let Some(part) = m.try_next().await? {
            match part {
                Part::Field(field) => {
                    out.push((field.name().to_owned(), None, field.into_value().into_bytes()))
                }
                Part::File(file) => {
                    let name = file.name().to_owned();
                    let filename = file.filename().to_owned();
                    let bytes = file.bytes().await?;
                    out.push((name, Some(filename), bytes.to_vec()));
                }
            }
        }
        Ok(out)
    }

    #[tokio::test]
    async fn parts_in_wire_order() {
        let body = encode(&[
            ("fooPart", Some("foo.txt"), b"Lorem ipsum\r\ndolor"),
            ("barPart", None, b"bar"),
            ("empty", Some(""), b""),
            ("barPart", None, b"again"),
        ]);

        let parts = summarize(multipart(&body, body.len())).await.unwrap();
        assert_eq!(
            vec![
                ("fooPart".to_owned(), Some("foo.txt".to_owned()), b"Lorem ipsum\r\ndolor".to_vec()),
                ("barPart".to_owned(), None, b"bar".to_vec()),
                ("empty".to_owned(), Some(String::new()), Vec::new()),
                ("barPart".to_owned(), None, b"again".to_vec()),
            ],
            parts
        );
    }

    #[tokio::test]
    async fn chunking_does_not_change_result() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        let body = encode(&[
            ("a", None, b"first value"),
            ("upload", Some("data.bin"), &payload),
            ("b", None, b"--1a2b3 almost a boundary"),
        ]);

        let reference = summarize(multipart(&body, body.len())).await.unwrap();
        assert_eq!(3, reference.len());
        assert_eq!(payload, reference[1].2);

        for size in [1, 2, 3, 7, 10, 13, 64, 511, 1024] {
            let got = summarize(multipart(&body, size)).await.unwrap();
            assert_eq!(reference, got, "chunk size {}", size);
        }
    }

    #[tokio::test]
    async fn to_map_literal_scenario() {
        let body = encode(&[
            ("fooPart", Some("foo.txt"), b"foo contents"),
            ("barPart", None, b"bar"),
        ]);

        let mut map = multipart(&body, 5).to_map().await.unwrap();
        assert_eq!(2, map.len());

        match map.remove("fooPart") {
            Some(Part::File(file)) => {
                assert_eq!("foo.txt", file.filename());
                assert_eq!(&b"foo contents"[..], &file.bytes().await.unwrap()[..]);
            }
            other => panic!("expected a file part, got {:?}", other),
        }
        match map.remove("barPart") {
            Some(Part::Field(field)) => assert_eq!("bar", field.value()),
            other => panic!("expected a field part, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_names() {
        let body = encode(&[("dup", None, b"first"), ("dup", None, b"second")]);

        let map = multipart(&body, 4).to_map().await.unwrap();
        match map.get("dup") {
            Some(Part::Field(field)) => assert_eq!("second", field.value()),
            other => panic!("unexpected {:?}", other),
        }

        let multi = multipart(&body, 4).to_multi_map().await.unwrap();
        let values: Vec<&str> = multi["dup"]
            .iter()
            .filter_map(|p| match p {
                Part::Field(f) => Some(f.value()),
                Part::File(_) => None,
            })
            .collect();
        assert_eq!(vec!["first", "second"], values);
    }

    #[tokio::test]
    async fn skipped_body_reports_error() {
        let body = encode(&[
            ("upload", Some("big.bin"), &[7u8; 4096]),
            ("after", None, b"ok"),
        ]);
        let mut m = multipart(&body, 100);

        let file = match m.try_next().await.unwrap() {
            Some(Part::File(file)) => file,
            other => panic!("unexpected {:?}", other),
        };
        let mut file_body = file.into_body();
        let first = file_body.try_next().await.unwrap().unwrap();
        assert!(!first.is_empty());

        match m.try_next().await.unwrap() {
            Some(Part::Field(field)) => assert_eq!("ok", field.value()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            file_body.try_next().await,
            Err(Error::BodySkipped)
        ));
        assert!(m.try_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_message_fails_once() {
        let mut body = encode(&[("a", None, b"value"), ("upload", Some("x"), b"data")]);
        body.truncate(body.len() - 10);

        let mut m = multipart(&body, 16);
        assert!(matches!(m.try_next().await, Ok(Some(Part::Field(_)))));

        let file = match m.try_next().await.unwrap() {
            Some(Part::File(file)) => file,
            other => panic!("unexpected {:?}", other),
        };
        assert!(matches!(
            file.bytes().await,
            Err(Error::MalformedMultipart(_))
        ));
        assert!(m.try_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_name_rejects_message() {
        let body = format!(
            "--{b}\r\nContent-Type: text/plain\r\n\r\nx\r\n--{b}--\r\n",
            b = BOUNDARY
        );
        let res = multipart(body.as_bytes(), 8).collect_parts().await;
        assert!(matches!(res, Err(Error::MissingName)));
    }

    #[tokio::test]
    async fn file_limit() {
        let body = encode(&[("upload", Some("big.bin"), &[1u8; 100])]);
        let chunks: Vec<Result<Vec<u8>, Infallible>> = vec![Ok(body)];
        let config = Config::new().max_file_bytes(50);
        let m = Multipart::new(stream::iter(chunks), BOUNDARY, config);

        assert!(matches!(
            m.to_map().await,
            Err(Error::FileTooLarge { limit: 50, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn large_files_are_spooled() {
        let large: Vec<u8> = (0..(3 * 1024 * 1024u32)).map(|i| (i % 253) as u8).collect();
        let body = encode(&[
            ("small", Some("small.txt"), b"tiny"),
            ("large", Some("large.bin"), &large),
            ("after", None, b"ok"),
        ]);

        let mut map = multipart(&body, 64 * 1024).to_map().await.unwrap();

        match map.remove("small") {
            Some(Part::File(file)) => {
                let body = file.into_body();
                assert!(body.is_buffered());
                let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
                assert_eq!(b"tiny".to_vec(), chunks.concat());
            }
            other => panic!("unexpected {:?}", other),
        }
        match map.remove("large") {
            Some(Part::File(file)) => {
                assert_eq!("large.bin", file.filename());
                let body = file.into_body();
                assert!(body.is_spooled());
                let chunks: Vec<Bytes> = body.try_collect().await.unwrap();
                assert_eq!(large, chunks.concat());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(map.get("after"), Some(Part::Field(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spool_threshold_and_limit() {
        let payload = [9u8; 5000];
        let body = encode(&[("upload", Some("x.bin"), &payload)]);

        let config = Config::default().spool_threshold(1000);
        let parts = Multipart::new(
            stream::iter(vec![Ok::<_, Infallible>(body.clone())]),
            BOUNDARY,
            config,
        )
        .collect_parts()
        .await
        .unwrap();
        match parts.into_iter().next() {
            Some(Part::File(file)) => {
                let dir = tempfile::tempdir().unwrap();
                let dest = dir.path().join("copy.bin");
                file.transfer_to(&dest).await.unwrap();
                assert_eq!(payload.to_vec(), std::fs::read(&dest).unwrap());
            }
            other => panic!("unexpected {:?}", other),
        }

        let config = Config::default().spool_threshold(1000).max_file_bytes(4000);
        let res = Multipart::new(stream::iter(vec![Ok::<_, Infallible>(body)]), BOUNDARY, config)
            .to_map()
            .await;
        assert!(matches!(res, Err(Error::FileTooLarge { limit: 4000, .. })));
    }

    /// Counts pulled chunks and notices when it is dropped.
    struct Watched<S> {
        inner: S,
        pulled: Arc<AtomicUsize>,
        dropped: Arc<AtomicBool>,
    }

    impl<S: Stream + Unpin> Stream for Watched<S> {
        type Item = S::Item;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<S::Item>> {
            let polled = Pin::new(&mut self.inner).poll_next(cx);
            if let Poll::Ready(Some(_)) = polled {
                self.pulled.fetch_add(1, Ordering::SeqCst);
            }
            polled
        }
    }

    impl<S> Drop for Watched<S> {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn abandoned_message_releases_body() {
        let body = encode(&[
            ("upload", Some("big.bin"), &[3u8; 10_000]),
            ("after", None, b"never read"),
        ]);
        let chunks: Vec<Result<Vec<u8>, Infallible>> =
            body.chunks(100).map(|c| Ok(c.to_vec())).collect();
        let total = chunks.len();

        let pulled = Arc::new(AtomicUsize::new(0));
        let dropped = Arc::new(AtomicBool::new(false));
        let watched = Watched {
            inner: stream::iter(chunks),
            pulled: Arc::clone(&pulled),
            dropped: Arc::clone(&dropped),
        };
        let mut m = Multipart::new(watched, BOUNDARY, Config::default());

        let file = match m.try_next().await.unwrap() {
            Some(Part::File(file)) => file,
            other => panic!("unexpected {:?}", other),
        };
        let mut file_body = file.into_body();
        assert!(file_body.try_next().await.unwrap().is_some());
        let pulled_so_far = pulled.load(Ordering::SeqCst);
        assert!(pulled_so_far < total / 2, "pulled {} of {}", pulled_so_far, total);

        drop(m);
        assert!(!dropped.load(Ordering::SeqCst));
        assert_eq!(pulled_so_far, pulled.load(Ordering::SeqCst));

        drop(file_body);
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn inner_stream_error() {
        let chunks: Vec<Result<Vec<u8>, &str>> = vec![
            Ok(format!("--{}\r\n", BOUNDARY).into_bytes()),
            Err("connection reset"),
        ];
        let mut m = Multipart::new(stream::iter(chunks), BOUNDARY, Config::default());
        match m.try_next().await {
            Err(Error::InnerStream(msg)) => assert!(msg.contains("connection reset")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(m.try_next().await.unwrap().is_none());
    }
}
