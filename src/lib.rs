//! Streaming `multipart/form-data` decoding for hyper requests.
//!
//! A request body is split into [`Part`]s without buffering it whole. Form
//! fields arrive decoded; file uploads expose a lazy [`FileBody`] that can be
//! streamed to disk with [`FilePart::transfer_to`], which runs every
//! filesystem call on a [`BlockingPool`].
//!
//! ```no_run
//! use futures::TryStreamExt;
//! use hyper_form_data::{MultipartRequest, Part};
//!
//! async fn handle(req: hyper::Request<hyper::Body>) -> Result<(), hyper_form_data::Error> {
//!     let mut parts = req.into_multipart()?;
//!     while let Some(part) = parts.try_next().await? {
//!         match part {
//!             Part::Field(field) => println!("{} = {}", field.name(), field.value()),
//!             Part::File(file) => {
//!                 let dest = std::env::temp_dir().join(file.filename());
//!                 file.transfer_to(dest).await?;
//!             }
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod error;
pub use error::Error;

mod config;
pub use config::{
    Config, DEFAULT_BUFFER_CAP, DEFAULT_MAX_FIELD_BYTES, DEFAULT_MAX_HEADER_BYTES,
    DEFAULT_SPOOL_THRESHOLD,
};

mod multipart;
pub use multipart::{Multipart, MultipartRequest};

mod part;
pub use part::{FilePart, FormFieldPart, Part};

mod body;
pub use body::FileBody;

mod assembler;

pub mod parser;

mod blocking;
pub use blocking::{BlockingPool, DEFAULT_BLOCKING_PERMITS};

mod transfer;
pub use transfer::{TransferSink, TransferState};

mod spool;

mod header_map;
pub use header_map::HeaderMap;

use futures::Stream;

/// Longest boundary allowed by RFC 2046.
const MAX_BOUNDARY_LEN: usize = 70;

/// Extracts the boundary from a `multipart/form-data` Content-Type value.
pub fn boundary(content_type: &str) -> Result<String, Error> {
    let mime_type = content_type
        .parse::<mime::Mime>()
        .map_err(Error::InvalidMimeType)?;

    if mime_type.type_() != mime::MULTIPART || mime_type.subtype() != mime::FORM_DATA {
        return Err(Error::NotMultipart);
    }

    let boundary = mime_type
        .get_param(mime::BOUNDARY)
        .ok_or(Error::BoundaryMissing)?;

    let boundary = boundary.as_str().trim_matches('"');
    match boundary.len() {
        0 => Err(Error::malformed("empty boundary")),
        n if n > MAX_BOUNDARY_LEN => Err(Error::malformed(format!(
            "boundary longer than {} characters",
            MAX_BOUNDARY_LEN
        ))),
        _ => Ok(boundary.to_owned()),
    }
}

pub fn from_headers<H, S, I, E>(headers: &H, s: S) -> Result<Multipart, Error>
where
    H: HeaderMap + ?Sized,
    S: Stream<Item = Result<I, E>> + Unpin + Send + 'static,
    I: AsRef<[u8]>,
    E: std::fmt::Display,
{
    from_headers_with_config(headers, s, Config::default())
}

pub fn from_headers_with_config<H, S, I, E>(
    headers: &H,
    s: S,
    config: Config,
) -> Result<Multipart, Error>
where
    H: HeaderMap + ?Sized,
    S: Stream<Item = Result<I, E>> + Unpin + Send + 'static,
    I: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let boundary = boundary(headers.content_type()?)?;
    log::debug!("Decoding multipart/form-data with boundary {:?}", boundary);
    Ok(Multipart::new(s, boundary, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_from_content_type() {
        assert_eq!(
            "abc123",
            boundary("multipart/form-data; boundary=abc123").unwrap()
        );
        assert_eq!(
            "----WebKitFormBoundary7MA4YWxkTrZu0gW",
            boundary("multipart/form-data; boundary=----WebKitFormBoundary7MA4YWxkTrZu0gW")
                .unwrap()
        );
    }

    #[test]
    fn rejects_other_content_types() {
        assert!(matches!(
            boundary("application/json"),
            Err(Error::NotMultipart)
        ));
        assert!(matches!(
            boundary("multipart/mixed; boundary=x"),
            Err(Error::NotMultipart)
        ));
        assert!(matches!(
            boundary("multipart/form-data"),
            Err(Error::BoundaryMissing)
        ));
        assert!(matches!(boundary("not a mime"), Err(Error::InvalidMimeType(_))));

        let long = format!("multipart/form-data; boundary={}", "x".repeat(71));
        assert!(matches!(
            boundary(&long),
            Err(Error::MalformedMultipart(_))
        ));
    }
}
