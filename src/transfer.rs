use crate::{blocking::PooledFile, BlockingPool, Error};
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use std::{
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Opening,
    Writing,
    Closing,
    Done,
    Failed,
}

/// Writes a file body to a destination path.
///
/// The next chunk is only requested once the previous one is on disk, so
/// neither the request body nor the file side buffers more than one chunk.
/// A sink is single use: `Done` and `Failed` are terminal.
#[derive(Debug)]
pub struct TransferSink {
    path: PathBuf,
    pool: BlockingPool,
    state: TransferState,
    written: u64,
}

impl TransferSink {
    pub fn new<P: Into<PathBuf>>(path: P, pool: BlockingPool) -> Self {
        Self {
            path: path.into(),
            pool,
            state: TransferState::Idle,
            written: 0,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates (or truncates) the destination and streams `body` into it.
    pub async fn drain<B>(&mut self, mut body: B) -> Result<(), Error>
    where
        B: Stream<Item = Result<Bytes, Error>> + Unpin,
    {
        if self.state != TransferState::Idle {
            return Err(self.io_error(io::Error::new(
                io::ErrorKind::Other,
                "transfer sink already used",
            )));
        }

        let res = self.write_all(&mut body).await;

        match res {
            Ok(()) => {
                self.state = TransferState::Done;
                log::debug!("Transferred {} bytes to {:?}", self.written, self.path);
            }
            Err(ref e) => {
                self.state = TransferState::Failed;
                log::warn!("Transfer to {:?} failed: {}", self.path, e);
            }
        }

        res
    }

    async fn write_all<B>(&mut self, body: &mut B) -> Result<(), Error>
    where
        B: Stream<Item = Result<Bytes, Error>> + Unpin,
    {
        self.state = TransferState::Opening;
        let path = self.path.clone();
        let file = self
            .pool
            .run(move || File::create(path))
            .await
            .map_err(|e| self.io_error(e))?;
        // Closed on the pool if this future is dropped or a chunk fails.
        let mut file = PooledFile::new(file, self.pool.clone());

        self.state = TransferState::Writing;
        while let Some(chunk) = body.try_next().await? {
            let len = chunk.len() as u64;
            file.with(move |f| f.write_all(&chunk))
                .await
                .map_err(|e| self.io_error(e))?;
            self.written += len;
        }

        self.state = TransferState::Closing;
        file.with(|f| f.sync_all())
            .await
            .map_err(|e| self.io_error(e))?;
        file.close().await.map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: io::Error) -> Error {
        Error::Transfer {
            path: self.path.clone(),
            written: self.written,
            source,
        }
    }
}
