use crate::{spool::Spool, BlockingPool, Error, FileBody, TransferSink};
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE};
use std::{collections::VecDeque, path::Path};

/// One named segment of a `multipart/form-data` body.
#[derive(Debug)]
pub enum Part {
    Field(FormFieldPart),
    File(FilePart),
}

impl Part {
    pub fn name(&self) -> &str {
        match self {
            Part::Field(field) => field.name(),
            Part::File(file) => file.name(),
        }
    }

    pub fn headers(&self) -> &HeaderMap {
        match self {
            Part::Field(field) => field.headers(),
            Part::File(file) => file.headers(),
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Part::File(_))
    }
}

/// A simple text field, fully read and decoded.
#[derive(Debug)]
pub struct FormFieldPart {
    head: PartHead,
    value: String,
}

impl FormFieldPart {
    pub(crate) fn decode(head: PartHead, body: &[u8]) -> Result<Self, Error> {
        let value = decode_text(&head, body)?;
        Ok(Self { head, value })
    }

    pub fn name(&self) -> &str {
        &self.head.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn into_value(self) -> String {
        self.value
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }
}

/// An uploaded file. The body is read lazily, by exactly one consumer.
#[derive(Debug)]
pub struct FilePart {
    head: PartHead,
    filename: String,
    body: FileBody,
    pool: BlockingPool,
}

impl FilePart {
    pub(crate) fn new(mut head: PartHead, body: FileBody, pool: BlockingPool) -> Self {
        let filename = head.filename.take().unwrap_or_default();
        Self {
            head,
            filename,
            body,
            pool,
        }
    }

    pub fn name(&self) -> &str {
        &self.head.name
    }

    /// The `filename` parameter, empty if the client sent `filename=""`.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn content_type(&self) -> Option<mime::Mime> {
        self.head
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
    }

    pub fn into_body(self) -> FileBody {
        self.body
    }

    /// Reads the whole body into memory.
    pub async fn bytes(self) -> Result<Bytes, Error> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        Ok(chunks.concat().into())
    }

    /// Streams the body into a freshly created file at `dest`.
    ///
    /// Every filesystem call runs on the message's blocking pool. On error the
    /// destination may hold a partial copy; removing it is up to the caller.
    pub async fn transfer_to<P: AsRef<Path>>(self, dest: P) -> Result<(), Error> {
        let mut sink = TransferSink::new(dest.as_ref(), self.pool);
        sink.drain(self.body).await
    }

    /// Drains a streaming body so the message can move on. Small bodies
    /// stay in memory; past `spool_threshold` the body goes to a temp file.
    pub(crate) async fn buffer(
        self,
        spool_threshold: usize,
        limit: Option<usize>,
    ) -> Result<Self, Error> {
        let FilePart {
            head,
            filename,
            mut body,
            pool,
        } = self;

        let mut chunks = VecDeque::new();
        let mut size = 0;
        while size <= spool_threshold {
            match body.try_next().await? {
                Some(chunk) => {
                    size += chunk.len();
                    check_file_size(&head.name, size, limit)?;
                    chunks.push_back(chunk);
                }
                None => {
                    return Ok(FilePart {
                        head,
                        filename,
                        body: FileBody::buffered(chunks),
                        pool,
                    })
                }
            }
        }

        let mut spool = Spool::create(&pool).await?;
        log::debug!("File part {:?} spooled to {:?}", head.name, spool.path());

        let name = head.name.clone();
        let rest = body.map(move |res: Result<Bytes, Error>| -> Result<Bytes, Error> {
            let chunk = res?;
            size += chunk.len();
            check_file_size(&name, size, limit)?;
            Ok(chunk)
        });
        spool
            .fill(stream::iter(chunks.into_iter().map(Ok)).chain(rest))
            .await?;

        Ok(FilePart {
            head,
            filename,
            body: spool.into_body(),
            pool,
        })
    }
}

fn check_file_size(name: &str, size: usize, limit: Option<usize>) -> Result<(), Error> {
    match limit {
        Some(limit) if size > limit => Err(Error::FileTooLarge {
            name: name.to_owned(),
            limit,
        }),
        _ => Ok(()),
    }
}

/// Name, filename and raw headers of a part, known before its body.
#[derive(Debug)]
pub(crate) struct PartHead {
    pub(crate) name: String,
    pub(crate) filename: Option<String>,
    pub(crate) headers: HeaderMap,
}

impl PartHead {
    pub(crate) fn from_lines<L: AsRef<[u8]>>(lines: &[L]) -> Result<Self, Error> {
        let mut headers = HeaderMap::new();

        for line in lines {
            match parse_header_line(line.as_ref()) {
                Some((name, value)) => {
                    headers.append(name, value);
                }
                None => log::debug!(
                    "Skipping malformed part header: {:?}",
                    String::from_utf8_lossy(line.as_ref())
                ),
            }
        }

        let disposition = headers
            .get(CONTENT_DISPOSITION)
            .ok_or(Error::MissingName)?;
        let disposition = std::str::from_utf8(disposition.as_bytes())
            .map_err(|_| Error::malformed("Content-Disposition is not valid UTF-8"))?;

        let mut name = None;
        let mut filename = None;
        for (key, value) in disposition_params(disposition) {
            if key.eq_ignore_ascii_case("name") {
                name = Some(value);
            } else if key.eq_ignore_ascii_case("filename") {
                filename = Some(value);
            }
        }

        Ok(PartHead {
            name: name.ok_or(Error::MissingName)?,
            filename,
            headers,
        })
    }
}

fn parse_header_line(line: &[u8]) -> Option<(HeaderName, HeaderValue)> {
    let colon = line.iter().position(|b| *b == b':')?;

    let name = HeaderName::from_bytes(trim(&line[..colon])).ok()?;
    let value = HeaderValue::from_bytes(trim(&line[colon + 1..])).ok()?;

    Some((name, value))
}

fn trim(mut bs: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bs {
        if !first.is_ascii_whitespace() {
            break;
        }
        bs = rest;
    }
    while let [rest @ .., last] = bs {
        if !last.is_ascii_whitespace() {
            break;
        }
        bs = rest;
    }
    bs
}

/// The `key=value` parameters following the disposition type.
fn disposition_params(value: &str) -> Vec<(&str, String)> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;

    for (i, c) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ';' if !quoted => {
                segments.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    segments.push(&value[start..]);

    segments
        .into_iter()
        .skip(1)
        .filter_map(|segment| {
            let (key, value) = segment.split_once('=')?;
            Some((key.trim(), unquote(value.trim())))
        })
        .collect()
}

fn unquote(value: &str) -> String {
    if value.len() < 2 || !value.starts_with('"') || !value.ends_with('"') {
        return value.to_owned();
    }

    let inner = &value[1..value.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        // Only \" and \\ are escapes, so Windows paths survive.
        if c == '\\' && matches!(chars.peek(), Some('"') | Some('\\')) {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn decode_text(head: &PartHead, body: &[u8]) -> Result<String, Error> {
    let charset = head
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<mime::Mime>().ok())
        .and_then(|m| m.get_param(mime::CHARSET).map(|c| c.as_str().to_ascii_lowercase()));

    let invalid = |charset| Error::InvalidFieldText {
        name: head.name.clone(),
        charset,
    };

    match charset.as_deref() {
        None | Some("utf-8") | Some("utf8") => {
            String::from_utf8(body.to_vec()).map_err(|_| invalid("utf-8"))
        }
        Some("us-ascii") | Some("ascii") => {
            if body.is_ascii() {
                Ok(body.iter().map(|&b| b as char).collect())
            } else {
                Err(invalid("us-ascii"))
            }
        }
        Some("iso-8859-1") | Some("latin1") => Ok(body.iter().map(|&b| b as char).collect()),
        Some(other) => Err(Error::UnsupportedCharset(other.to_owned())),
    }
}
