use std::{error::Error as StdError, fmt, io, path::PathBuf};

#[derive(Debug)]
pub enum Error {
    /// Cannot turn a request without a Content-Type into multipart.
    ContentTypeMissing,
    InvalidHeader(http::header::ToStrError),
    InvalidMimeType(mime::FromStrError),
    /// The Content-Type was not `multipart/form-data`.
    NotMultipart,
    BoundaryMissing,
    MalformedMultipart(String),
    /// A part without `Content-Disposition` or without its `name` parameter.
    MissingName,
    HeadersTooLarge(usize),
    FieldTooLarge {
        name: String,
        limit: usize,
    },
    FileTooLarge {
        name: String,
        limit: usize,
    },
    TooManyParts(usize),
    UnsupportedCharset(String),
    InvalidFieldText {
        name: String,
        charset: &'static str,
    },
    InnerStream(String),
    /// The message was already aborted by an earlier error.
    Aborted,
    /// A file body was read after the message moved on to a later part.
    BodySkipped,
    Transfer {
        path: PathBuf,
        written: u64,
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn malformed<S: Into<String>>(msg: S) -> Self {
        Error::MalformedMultipart(msg.into())
    }

    pub(crate) fn inner<E: fmt::Display>(e: E) -> Self {
        Error::InnerStream(format!("{}", e))
    }

    /// True for failures scoped to a single file part rather than the whole message.
    pub fn is_transfer(&self) -> bool {
        matches!(self, Error::Transfer { .. } | Error::BodySkipped)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::ContentTypeMissing => write!(f, "Content Type header missing from request"),
            Error::InvalidHeader(ref e) => write!(f, "Content-Type header is not a string: {}", e),
            Error::InvalidMimeType(ref e) => write!(f, "Content-Type value invalid: {}", e),
            Error::NotMultipart => write!(f, "Cannot handle a non multipart/form-data request"),
            Error::BoundaryMissing => write!(f, "Content-Type has no boundary parameter"),
            Error::MalformedMultipart(ref msg) => write!(f, "Malformed Multipart: {}", msg),
            Error::MissingName => write!(f, "Part is missing the Content-Disposition name"),
            Error::HeadersTooLarge(limit) => {
                write!(f, "Part headers exceed the limit of {} bytes", limit)
            }
            Error::FieldTooLarge { ref name, limit } => {
                write!(f, "Field {:?} exceeds the limit of {} bytes", name, limit)
            }
            Error::FileTooLarge { ref name, limit } => {
                write!(f, "File part {:?} exceeds the limit of {} bytes", name, limit)
            }
            Error::TooManyParts(limit) => write!(f, "Message has more than {} parts", limit),
            Error::UnsupportedCharset(ref charset) => {
                write!(f, "Unsupported field charset: {}", charset)
            }
            Error::InvalidFieldText { ref name, charset } => {
                write!(f, "Field {:?} is not valid {}", name, charset)
            }
            Error::InnerStream(ref e) => write!(f, "InnerStream: {}", e),
            Error::Aborted => write!(f, "Multipart message aborted by an earlier error"),
            Error::BodySkipped => write!(f, "File body was skipped before it was read"),
            Error::Transfer {
                ref path,
                written,
                ref source,
            } => write!(
                f,
                "Transfer to {} failed after {} bytes: {}",
                path.display(),
                written,
                source
            ),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match *self {
            Error::InvalidHeader(ref e) => Some(e),
            Error::InvalidMimeType(ref e) => Some(e),
            Error::Transfer { ref source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(inner: hyper::Error) -> Self {
        Error::InnerStream(format!("Hyper error: {}", inner))
    }
}
