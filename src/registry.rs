//! Named objects shared between the client and the display server.
//!
//! Three kinds of object live here: sections (named shared memory), signals
//! (auto-reset events carried in a tiny section, see [`crate::signal`]) and
//! liveness leases (see [`crate::lease`]). Handles close on drop.

use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use memmap2::{MmapOptions, MmapRaw};
use nix::{
    errno::Errno,
    fcntl::OFlag,
    sys::{
        mman::{shm_open, shm_unlink},
        stat::Mode,
    },
};

use crate::{
    config::SessionConfig,
    error::{Error, Result},
    lease::{FileLease, Lease, LeaseWatch, LocalLease},
    names::Namespace,
    signal::Signal,
};

/// A mapped view of a named section.
///
/// Every `open` maps the backing bytes again, so two handles in one process
/// still address the same memory.
#[derive(Clone)]
pub struct Section {
    name: String,
    map: Arc<MmapRaw>,
}

impl Section {
    fn new(name: &str, map: MmapRaw) -> Self {
        Self {
            name: name.to_string(),
            map: Arc::new(map),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub(crate) fn require_len(&self, expected: usize) -> Result<()> {
        if self.len() < expected {
            return Err(Error::SizeMismatch {
                name: self.name.clone(),
                expected,
                actual: self.len(),
            });
        }
        Ok(())
    }

    /// Reinterpret `offset..offset + size_of::<T>()` as a `T`.
    ///
    /// # Safety
    ///
    /// `T` must be valid for every bit pattern, use only interior mutability
    /// (atomics) and the range must be in bounds and aligned for `T`.
    pub(crate) unsafe fn view<T>(&self, offset: usize) -> &T {
        debug_assert!(offset + std::mem::size_of::<T>() <= self.len());
        let ptr = unsafe { self.as_ptr().add(offset) };
        debug_assert_eq!(ptr as usize % std::mem::align_of::<T>(), 0);
        unsafe { &*(ptr as *const T) }
    }
}

impl std::fmt::Debug for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Section")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

/// Creates and opens named objects by their well-known names.
///
/// `open_*` fails with [`Error::NotFound`] when no creator has published the
/// name yet.
pub trait Registry: Send + Sync {
    fn create_section(&self, name: &str, len: usize) -> Result<Section>;

    fn open_section(&self, name: &str) -> Result<Section>;

    /// Take the lease called `name`; it is released when the returned
    /// handle drops or the owning process dies.
    fn acquire_lease(&self, name: &str) -> Result<Lease>;

    fn watch_lease(&self, name: &str) -> Result<LeaseWatch>;

    /// Remove `name` so later opens fail. Existing handles stay valid.
    fn unlink(&self, name: &str);

    fn create_signal(&self, name: &str) -> Result<Signal> {
        Signal::new(self.create_section(name, Signal::LEN)?)
    }

    fn open_signal(&self, name: &str) -> Result<Signal> {
        Signal::new(self.open_section(name)?)
    }
}

/// POSIX shared memory (`/dev/shm`) plus `flock(2)` lease files.
#[derive(Clone, Debug)]
pub struct ShmRegistry {
    namespace: Namespace,
    lease_dir: PathBuf,
}

impl ShmRegistry {
    pub fn new(namespace: Namespace, lease_dir: impl Into<PathBuf>) -> Self {
        Self {
            namespace,
            lease_dir: lease_dir.into(),
        }
    }

    pub fn for_config(config: &SessionConfig) -> Self {
        Self::new(config.namespace.clone(), config.runtime_dir.clone())
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn lease_dir(&self) -> &Path {
        &self.lease_dir
    }

    fn shm_name(&self, name: &str) -> String {
        format!("/{}", self.namespace.qualify(name))
    }

    fn lease_path(&self, name: &str) -> PathBuf {
        self.lease_dir
            .join(format!("{}.lease", self.namespace.qualify(name)))
    }
}

fn shm_mode() -> Mode {
    Mode::S_IRUSR | Mode::S_IWUSR
}

impl Registry for ShmRegistry {
    fn create_section(&self, name: &str, len: usize) -> Result<Section> {
        if len == 0 {
            return Err(Error::SizeMismatch {
                name: name.to_string(),
                expected: 1,
                actual: 0,
            });
        }
        let shm_name = self.shm_name(name);
        let fd = match shm_open(
            shm_name.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            shm_mode(),
        ) {
            Ok(fd) => fd,
            Err(Errno::EEXIST) => {
                tracing::warn!(name = %shm_name, "reusing stale shared section");
                shm_open(shm_name.as_str(), OFlag::O_RDWR | OFlag::O_TRUNC, shm_mode())
                    .map_err(|err| Error::os("shm_open", err))?
            }
            Err(err) => return Err(Error::os("shm_open", err)),
        };

        let file = File::from(fd);
        file.set_len(len as u64)?;
        let map = MmapOptions::new().len(len).map_raw(&file)?;
        tracing::debug!(name = %shm_name, len, "created section");
        Ok(Section::new(name, map))
    }

    fn open_section(&self, name: &str) -> Result<Section> {
        let shm_name = self.shm_name(name);
        let fd = match shm_open(shm_name.as_str(), OFlag::O_RDWR, shm_mode()) {
            Ok(fd) => fd,
            Err(Errno::ENOENT) => {
                return Err(Error::NotFound {
                    name: name.to_string(),
                });
            }
            Err(err) => return Err(Error::os("shm_open", err)),
        };

        let file = File::from(fd);
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::SizeMismatch {
                name: name.to_string(),
                expected: 1,
                actual: 0,
            });
        }
        let map = MmapOptions::new().len(len).map_raw(&file)?;
        tracing::debug!(name = %shm_name, len, "opened section");
        Ok(Section::new(name, map))
    }

    fn acquire_lease(&self, name: &str) -> Result<Lease> {
        std::fs::create_dir_all(&self.lease_dir)?;
        FileLease::acquire(name, &self.lease_path(name))
    }

    fn watch_lease(&self, name: &str) -> Result<LeaseWatch> {
        FileLease::watch(name, &self.lease_path(name))
    }

    fn unlink(&self, name: &str) {
        let shm_name = self.shm_name(name);
        match shm_unlink(shm_name.as_str()) {
            Ok(()) | Err(Errno::ENOENT) => {}
            Err(err) => tracing::debug!(name = %shm_name, %err, "shm_unlink failed"),
        }
        let lease = self.lease_path(name);
        if let Err(err) = std::fs::remove_file(&lease) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %lease.display(), %err, "remove lease file failed");
            }
        }
    }
}

/// In-process registry: anonymous mappings and condvar leases.
///
/// Lets one test process host several simulated sessions, each with its own
/// instance, without touching `/dev/shm`.
#[derive(Default)]
pub struct MemoryRegistry {
    sections: Mutex<HashMap<String, Section>>,
    leases: Mutex<HashMap<String, LocalLease>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|err| err.into_inner())
}

impl Registry for MemoryRegistry {
    fn create_section(&self, name: &str, len: usize) -> Result<Section> {
        if len == 0 {
            return Err(Error::SizeMismatch {
                name: name.to_string(),
                expected: 1,
                actual: 0,
            });
        }
        let map = MmapOptions::new().len(len).map_anon()?;
        let section = Section::new(name, MmapRaw::from(map));
        if locked(&self.sections)
            .insert(name.to_string(), section.clone())
            .is_some()
        {
            tracing::warn!(name, "replaced stale in-memory section");
        }
        Ok(section)
    }

    fn open_section(&self, name: &str) -> Result<Section> {
        locked(&self.sections)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                name: name.to_string(),
            })
    }

    fn acquire_lease(&self, name: &str) -> Result<Lease> {
        let mut leases = locked(&self.leases);
        let cell = leases
            .entry(name.to_string())
            .or_insert_with(LocalLease::default);
        cell.acquire(name)
    }

    fn watch_lease(&self, name: &str) -> Result<LeaseWatch> {
        locked(&self.leases)
            .get(name)
            .map(|cell| cell.watch(name))
            .ok_or_else(|| Error::NotFound {
                name: name.to_string(),
            })
    }

    fn unlink(&self, name: &str) {
        locked(&self.sections).remove(name);
        locked(&self.leases).remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shm_registry() -> (ShmRegistry, PathBuf) {
        let dir = std::env::temp_dir().join(format!("bgi-registry-{}", Namespace::unique()));
        (ShmRegistry::new(Namespace::unique(), &dir), dir)
    }

    fn write_then_read(registry: &dyn Registry) {
        let created = registry.create_section("S", 4096).unwrap();
        let opened = registry.open_section("S").unwrap();
        assert_eq!(opened.len(), 4096);
        unsafe {
            created.as_ptr().add(100).write_volatile(0xAB);
            assert_eq!(opened.as_ptr().add(100).read_volatile(), 0xAB);
        }
        registry.unlink("S");
    }

    #[test]
    fn memory_sections_share_bytes() {
        write_then_read(&MemoryRegistry::new());
    }

    #[test]
    fn shm_sections_share_bytes() {
        let (registry, dir) = shm_registry();
        write_then_read(&registry);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn open_without_creator_is_not_found() {
        let (registry, _dir) = shm_registry();
        assert!(matches!(
            registry.open_section("missing"),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            MemoryRegistry::new().open_section("missing"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn unlinked_name_cannot_be_opened_but_handles_survive() {
        let (registry, dir) = shm_registry();
        let section = registry.create_section("S", 64).unwrap();
        registry.unlink("S");
        assert!(matches!(
            registry.open_section("S"),
            Err(Error::NotFound { .. })
        ));
        unsafe { section.as_ptr().write_volatile(1) };
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn stale_section_is_reset_on_create() {
        let (registry, dir) = shm_registry();
        let stale = registry.create_section("S", 64).unwrap();
        unsafe { stale.as_ptr().write_volatile(7) };
        drop(stale);

        let fresh = registry.create_section("S", 128).unwrap();
        assert_eq!(fresh.len(), 128);
        assert_eq!(unsafe { fresh.as_ptr().read_volatile() }, 0);
        registry.unlink("S");
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn zero_length_sections_are_rejected() {
        assert!(matches!(
            MemoryRegistry::new().create_section("S", 0),
            Err(Error::SizeMismatch { .. })
        ));
    }
}
