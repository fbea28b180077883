//! Liveness leases.
//!
//! Each side holds a lease for as long as it lives and never releases it on
//! purpose; the peer blocks in [`LeaseWatch::wait_for_release`]. The OS drops
//! the lease when the holder dies, so a crash turns into an ordinary wakeup
//! on the other side.

use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
};

use nix::{
    errno::Errno,
    fcntl::{Flock, FlockArg},
};

use crate::error::{Error, Result};

/// A held lease. Dropping it releases the lease.
pub struct Lease {
    name: String,
    _hold: Box<dyn Send>,
}

impl Lease {
    pub fn new(name: &str, hold: impl Send + 'static) -> Self {
        Self {
            name: name.to_string(),
            _hold: Box::new(hold),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("name", &self.name).finish()
    }
}

/// Backend hook for waiting on somebody else's lease.
pub trait ReleaseWait: Send {
    /// Block until the holder releases the lease or dies.
    fn wait_for_release(&mut self) -> Result<()>;

    fn is_released(&mut self) -> Result<bool>;
}

pub struct LeaseWatch {
    name: String,
    inner: Box<dyn ReleaseWait>,
}

impl LeaseWatch {
    pub fn new(name: &str, inner: impl ReleaseWait + 'static) -> Self {
        Self {
            name: name.to_string(),
            inner: Box::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn wait_for_release(&mut self) -> Result<()> {
        self.inner.wait_for_release()
    }

    pub fn is_released(&mut self) -> Result<bool> {
        self.inner.is_released()
    }
}

/// Run `on_release` on a dedicated thread once the watched lease goes away.
pub fn spawn_watcher<F>(mut watch: LeaseWatch, on_release: F) -> io::Result<JoinHandle<()>>
where
    F: FnOnce(Result<()>) + Send + 'static,
{
    thread::Builder::new()
        .name(format!("bgi-watch:{}", watch.name()))
        .spawn(move || {
            let res = watch.wait_for_release();
            on_release(res);
        })
}

pub(crate) struct FileLease;

impl FileLease {
    pub(crate) fn acquire(name: &str, path: &Path) -> Result<Lease> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                tracing::debug!(name, path = %path.display(), "lease acquired");
                Ok(Lease::new(name, lock))
            }
            Err((_, Errno::EWOULDBLOCK)) => Err(Error::AlreadyExists {
                name: name.to_string(),
            }),
            Err((_, err)) => Err(Error::os("flock", err)),
        }
    }

    pub(crate) fn watch(name: &str, path: &Path) -> Result<LeaseWatch> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound {
                    name: name.to_string(),
                });
            }
            Err(err) => return Err(err.into()),
        };
        Ok(LeaseWatch::new(
            name,
            FileWatch {
                file: Some(file),
                path: path.to_path_buf(),
            },
        ))
    }
}

struct FileWatch {
    file: Option<File>,
    path: PathBuf,
}

impl FileWatch {
    fn take_file(&mut self) -> Result<Option<File>> {
        if let Some(file) = self.file.take() {
            return Ok(Some(file));
        }
        match File::open(&self.path) {
            Ok(file) => Ok(Some(file)),
            // The holder unlinked its lease file on the way out.
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn lock(&mut self, arg: FlockArg) -> Result<bool> {
        let Some(mut file) = self.take_file()? else {
            return Ok(true);
        };
        loop {
            match Flock::lock(file, arg) {
                Ok(lock) => {
                    match lock.unlock() {
                        Ok(file) => self.file = Some(file),
                        Err((_, err)) => return Err(Error::os("flock unlock", err)),
                    }
                    return Ok(true);
                }
                Err((f, Errno::EINTR)) => file = f,
                Err((f, Errno::EWOULDBLOCK)) => {
                    self.file = Some(f);
                    return Ok(false);
                }
                Err((_, err)) => return Err(Error::os("flock", err)),
            }
        }
    }
}

impl ReleaseWait for FileWatch {
    fn wait_for_release(&mut self) -> Result<()> {
        self.lock(FlockArg::LockExclusive).map(|_| ())
    }

    fn is_released(&mut self) -> Result<bool> {
        self.lock(FlockArg::LockExclusiveNonblock)
    }
}

#[derive(Default)]
struct LeaseCell {
    held: Mutex<bool>,
    released: Condvar,
}

/// Lease slot of the in-process registry.
#[derive(Clone, Default)]
pub(crate) struct LocalLease {
    cell: Arc<LeaseCell>,
}

impl LocalLease {
    pub(crate) fn acquire(&self, name: &str) -> Result<Lease> {
        let mut held = self
            .cell
            .held
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        if *held {
            return Err(Error::AlreadyExists {
                name: name.to_string(),
            });
        }
        *held = true;
        Ok(Lease::new(
            name,
            LocalHold {
                cell: self.cell.clone(),
            },
        ))
    }

    pub(crate) fn watch(&self, name: &str) -> LeaseWatch {
        LeaseWatch::new(
            name,
            LocalWatch {
                cell: self.cell.clone(),
            },
        )
    }
}

struct LocalHold {
    cell: Arc<LeaseCell>,
}

impl Drop for LocalHold {
    fn drop(&mut self) {
        let mut held = self
            .cell
            .held
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        *held = false;
        self.cell.released.notify_all();
    }
}

struct LocalWatch {
    cell: Arc<LeaseCell>,
}

impl ReleaseWait for LocalWatch {
    fn wait_for_release(&mut self) -> Result<()> {
        let mut held = self
            .cell
            .held
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        while *held {
            held = self
                .cell
                .released
                .wait(held)
                .unwrap_or_else(|err| err.into_inner());
        }
        Ok(())
    }

    fn is_released(&mut self) -> Result<bool> {
        let held = self
            .cell
            .held
            .lock()
            .unwrap_or_else(|err| err.into_inner());
        Ok(!*held)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::{
        names::Namespace,
        registry::{MemoryRegistry, Registry, ShmRegistry},
    };

    fn watcher_sees_release(registry: &dyn Registry) {
        let lease = registry.acquire_lease("alive").unwrap();
        let mut watch = registry.watch_lease("alive").unwrap();
        assert!(!watch.is_released().unwrap());

        let (tx, rx) = mpsc::channel();
        spawn_watcher(watch, move |res| {
            let _ = tx.send(res.is_ok());
        })
        .unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        let dropped_at = Instant::now();
        drop(lease);
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        assert!(dropped_at.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn file_lease_release_wakes_watcher() {
        let dir = std::env::temp_dir().join(format!("bgi-lease-{}", Namespace::unique()));
        let registry = ShmRegistry::new(Namespace::unique(), &dir);
        watcher_sees_release(&registry);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn local_lease_release_wakes_watcher() {
        watcher_sees_release(&MemoryRegistry::new());
    }

    #[test]
    fn second_holder_is_refused() {
        let dir = std::env::temp_dir().join(format!("bgi-lease-{}", Namespace::unique()));
        let registry = ShmRegistry::new(Namespace::unique(), &dir);
        let _held = registry.acquire_lease("alive").unwrap();
        assert!(matches!(
            registry.acquire_lease("alive"),
            Err(Error::AlreadyExists { .. })
        ));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn stale_lease_file_can_be_retaken() {
        let dir = std::env::temp_dir().join(format!("bgi-lease-{}", Namespace::unique()));
        let registry = ShmRegistry::new(Namespace::unique(), &dir);
        drop(registry.acquire_lease("alive").unwrap());
        let _again = registry.acquire_lease("alive").unwrap();
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn watching_a_missing_lease_is_not_found() {
        let registry = MemoryRegistry::new();
        assert!(matches!(
            registry.watch_lease("nobody"),
            Err(Error::NotFound { .. })
        ));
    }
}
