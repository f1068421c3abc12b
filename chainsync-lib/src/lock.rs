use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use thiserror::Error;

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to open lock file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("Timed out after {} waiting for lock {path}", humantime::format_duration(*waited))]
    Timeout { path: PathBuf, waited: Duration },
    #[error("Locking {path} failed: {source}")]
    Flock { path: PathBuf, source: Errno },
    #[error("Lock state poisoned")]
    Poisoned,
}

/// Cross-process mutual exclusion around dataplane reads and writes.
#[async_trait]
pub trait DataplaneLock: Send + Sync {
    async fn lock(&self) -> Result<(), Error>;
    fn unlock(&self);
}

/// Releases the lock when dropped, on every exit path.
pub struct LockGuard<L: DataplaneLock + ?Sized> {
    lock: Arc<L>,
}

impl<L: DataplaneLock + ?Sized> LockGuard<L> {
    pub async fn acquire(lock: Arc<L>) -> Result<Self, Error> {
        lock.lock().await?;
        Ok(Self { lock })
    }
}

impl<L: DataplaneLock + ?Sized> Drop for LockGuard<L> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Advisory `flock` on a well known path, shared with other engine users.
pub struct FileLock {
    path: PathBuf,
    timeout: Duration,
    probe_interval: Duration,
    held: Mutex<Option<Flock<File>>>,
}

impl FileLock {
    pub fn new(path: &Path, timeout: Duration, probe_interval: Duration) -> Self {
        Self {
            path: path.to_path_buf(),
            timeout,
            probe_interval,
            held: Mutex::new(None),
        }
    }

    fn open(&self) -> Result<File, Error> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .map_err(|source| Error::Open {
                path: self.path.clone(),
                source,
            })
    }
}

#[async_trait]
impl DataplaneLock for FileLock {
    async fn lock(&self) -> Result<(), Error> {
        let started = Instant::now();
        let mut file = self.open()?;
        loop {
            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(flock) => {
                    let mut held = self.held.lock().map_err(|_| Error::Poisoned)?;
                    *held = Some(flock);
                    tracing::trace!(path = %self.path.display(), "lock acquired");
                    return Ok(());
                }
                Err((f, Errno::EWOULDBLOCK)) | Err((f, Errno::EINTR)) => {
                    let waited = started.elapsed();
                    if waited >= self.timeout {
                        return Err(Error::Timeout {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                    tracing::debug!(path = %self.path.display(), "lock busy, waiting");
                    file = f;
                    tokio::time::sleep(self.probe_interval).await;
                }
                Err((_, source)) => {
                    return Err(Error::Flock {
                        path: self.path.clone(),
                        source,
                    });
                }
            }
        }
    }

    fn unlock(&self) {
        match self.held.lock() {
            // dropping the Flock releases it
            Ok(mut held) => {
                if held.take().is_none() {
                    tracing::warn!(path = %self.path.display(), "unlock without holding the lock");
                }
            }
            Err(e) => tracing::error!(error = %e, "lock state poisoned on unlock"),
        }
    }
}
