use crate::Error;

/// Where a request's headers come from. Implemented for `http::HeaderMap`;
/// other frameworks plug in by implementing it for their own header type.
pub trait HeaderMap {
    /// The raw `Content-Type` value of the request.
    fn content_type(&self) -> Result<&str, Error>;
}

impl HeaderMap for http::header::HeaderMap {
    fn content_type(&self) -> Result<&str, Error> {
        self.get(http::header::CONTENT_TYPE)
            .ok_or(Error::ContentTypeMissing)?
            .to_str()
            .map_err(Error::InvalidHeader)
    }
}
