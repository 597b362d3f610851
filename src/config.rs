use crate::BlockingPool;

/// Default initial buffer capacity
pub const DEFAULT_BUFFER_CAP: usize = 35000;

pub const DEFAULT_MAX_HEADER_BYTES: usize = 10 * 1024;

pub const DEFAULT_MAX_FIELD_BYTES: usize = 256 * 1024;

/// File bodies collected by `Multipart::to_map` and friends move from memory
/// to a temp file once they grow past this size (1 MiB).
pub const DEFAULT_SPOOL_THRESHOLD: usize = 1024 * 1024;

/// Limits and executors used while decoding one message.
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) buffer_capacity: usize,
    pub(crate) max_header_bytes: usize,
    pub(crate) max_field_bytes: usize,
    pub(crate) spool_threshold: usize,
    pub(crate) max_file_bytes: Option<usize>,
    pub(crate) max_parts: Option<usize>,
    pub(crate) blocking: BlockingPool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAP,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_field_bytes: DEFAULT_MAX_FIELD_BYTES,
            spool_threshold: DEFAULT_SPOOL_THRESHOLD,
            max_file_bytes: None,
            max_parts: None,
            blocking: BlockingPool::default(),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial capacity of the parse buffer.
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Limit for the header section of a single part, separators included.
    pub fn max_header_bytes(mut self, limit: usize) -> Self {
        self.max_header_bytes = limit;
        self
    }

    /// Limit for the raw body of a form field.
    pub fn max_field_bytes(mut self, limit: usize) -> Self {
        self.max_field_bytes = limit;
        self
    }

    pub fn spool_threshold(mut self, size: usize) -> Self {
        self.spool_threshold = size;
        self
    }

    /// Limit for a file body collected by `Multipart::to_map` and friends,
    /// in memory or spooled. Unlimited by default.
    pub fn max_file_bytes(mut self, limit: usize) -> Self {
        self.max_file_bytes = Some(limit);
        self
    }

    pub fn max_parts(mut self, limit: usize) -> Self {
        self.max_parts = Some(limit);
        self
    }

    /// Pool that runs every filesystem call made on behalf of this message.
    pub fn blocking_pool(mut self, pool: BlockingPool) -> Self {
        self.blocking = pool;
        self
    }
}
