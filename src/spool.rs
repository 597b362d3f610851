use crate::{blocking::PooledFile, BlockingPool, Error, FileBody, TransferSink};
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use std::{
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};

/// Size of the chunks a spooled body is read back in.
const READ_CHUNK: usize = 64 * 1024;

/// A file body parked in a temp file, removed again when dropped.
#[derive(Debug)]
pub(crate) struct Spool {
    path: PathBuf,
    pool: BlockingPool,
    len: u64,
}

impl Spool {
    pub(crate) async fn create(pool: &BlockingPool) -> Result<Self, Error> {
        let path = pool
            .create_temp_file("hyper_form_data")
            .await
            .map_err(|source| Error::Transfer {
                path: std::env::temp_dir(),
                written: 0,
                source,
            })?;

        log::debug!("Spooling file body to {:?}", path);
        Ok(Self {
            path,
            pool: pool.clone(),
            len: 0,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `body` to the temp file.
    pub(crate) async fn fill<B>(&mut self, body: B) -> Result<(), Error>
    where
        B: Stream<Item = Result<Bytes, Error>> + Unpin,
    {
        let mut sink = TransferSink::new(&self.path, self.pool.clone());
        let res = sink.drain(body).await;
        self.len = sink.bytes_written();
        res
    }

    /// Streams the temp file back in order. The file is removed once the
    /// stream is finished or dropped.
    pub(crate) fn into_body(self) -> FileBody {
        let chunks = stream::try_unfold((self, None), |(spool, file)| async move {
            let mut file = match file {
                Some(file) => file,
                None => spool.open().await?,
            };

            let chunk = file
                .with(read_chunk)
                .await
                .map_err(|e| spool.io_error(e))?;

            if chunk.is_empty() {
                file.close().await.map_err(|e| spool.io_error(e))?;
                return Ok(None);
            }
            Ok(Some((chunk, (spool, Some(file)))))
        });

        FileBody::spooled(chunks.boxed())
    }

    async fn open(&self) -> Result<PooledFile, Error> {
        let path = self.path.clone();
        let file = self
            .pool
            .run(move || File::open(path))
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(PooledFile::new(file, self.pool.clone()))
    }

    fn io_error(&self, source: io::Error) -> Error {
        Error::Transfer {
            path: self.path.clone(),
            written: self.len,
            source,
        }
    }
}

impl Drop for Spool {
    fn drop(&mut self) {
        let path = self.path.clone();
        self.pool.detach(move || std::fs::remove_file(path));
    }
}

fn read_chunk(file: &mut File) -> io::Result<Bytes> {
    let mut buf = vec![0; READ_CHUNK];
    let n = file.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf.into())
}
