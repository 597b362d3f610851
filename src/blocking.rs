use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{runtime::Handle, sync::Semaphore};

/// Default number of filesystem calls allowed to run at the same time.
pub const DEFAULT_BLOCKING_PERMITS: usize = 16;

/// The boundary every blocking filesystem call goes through.
///
/// Work runs on tokio's blocking threads, at most `permits` at a time, and
/// the result is delivered back through the task's join handle. The async
/// caller never touches the disk itself.
#[derive(Clone, Debug)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
    handle: Option<Handle>,
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKING_PERMITS)
    }
}

impl BlockingPool {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(permits.max(1))),
            handle: None,
        }
    }

    /// Runs work on the blocking threads of `handle` instead of the runtime
    /// that happens to await it.
    pub fn with_handle(handle: Handle, permits: usize) -> Self {
        Self {
            handle: Some(handle),
            ..Self::new(permits)
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn run<F, T>(&self, work: F) -> io::Result<T>
    where
        F: FnOnce() -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "blocking pool closed"))?;

        // The permit lives as long as the work, even if the caller goes away.
        let work = move || {
            let _permit = permit;
            work()
        };

        let task = match self.handle {
            Some(ref handle) => handle.spawn_blocking(work),
            None => tokio::task::spawn_blocking(work),
        };

        task.await.map_err(|e| {
            io::Error::new(io::ErrorKind::Other, format!("blocking task failed: {}", e))
        })?
    }

    /// Creates an empty, uniquely named file in the system temp directory and
    /// returns its path. The file is kept; deleting it is up to the caller.
    pub async fn create_temp_file(&self, prefix: &str) -> io::Result<PathBuf> {
        let prefix = prefix.to_owned();
        self.run(move || {
            let file = tempfile::Builder::new().prefix(&prefix).tempfile()?;
            let (_, path) = file.keep().map_err(|e| e.error)?;
            Ok(path)
        })
        .await
    }

    pub async fn remove_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref().to_owned();
        self.run(move || std::fs::remove_file(path)).await
    }

    /// Queues `work` on the pool without waiting for it, for `Drop` impls
    /// that cannot await. Outside a runtime the work runs inline.
    pub(crate) fn detach<F>(&self, work: F)
    where
        F: FnOnce() -> io::Result<()> + Send + 'static,
    {
        let handle = match self.handle.clone().or_else(|| Handle::try_current().ok()) {
            Some(handle) => handle,
            None => {
                if let Err(e) = work() {
                    log::warn!("Blocking cleanup failed: {}", e);
                }
                return;
            }
        };

        let pool = self.clone();
        handle.spawn(async move {
            if let Err(e) = pool.run(work).await {
                log::warn!("Blocking cleanup failed: {}", e);
            }
        });
    }
}

/// An open file whose calls, close included, only ever run on a
/// [`BlockingPool`].
///
/// Dropping the handle while it still owns the file hands the close to the
/// pool instead of closing on the async thread.
#[derive(Debug)]
pub(crate) struct PooledFile {
    file: Option<File>,
    pool: BlockingPool,
}

impl PooledFile {
    pub(crate) fn new(file: File, pool: BlockingPool) -> Self {
        Self {
            file: Some(file),
            pool,
        }
    }

    /// Runs `work` against the file on the pool. The file travels with the
    /// work, so it is never touched from the caller's thread.
    pub(crate) async fn with<F, T>(&mut self, work: F) -> io::Result<T>
    where
        F: FnOnce(&mut File) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "file already closed"))?;

        let (file, res) = self
            .pool
            .run(move || {
                let res = work(&mut file);
                Ok((file, res))
            })
            .await?;

        self.file = Some(file);
        res
    }

    pub(crate) async fn close(mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => {
                self.pool
                    .run(move || {
                        drop(file);
                        Ok(())
                    })
                    .await
            }
            None => Ok(()),
        }
    }
}

impl Drop for PooledFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.pool.detach(move || {
                drop(file);
                Ok(())
            });
        }
    }
}
