//! The coverage map shared between the harness and an instrumented target.
//!
//! The map is a System V shared memory segment of [`MAP_SIZE`] bytes, one saturating
//! hit counter per instrumented edge. The target finds it through the decimal segment
//! id in [`SHM_ENV_VAR`]; size and variable name only change together.

use core::{
    fmt::{self, Display},
    ptr::{self, NonNull},
    str::FromStr,
};
use std::env;

use libc::{c_void, shmat, shmctl, shmdt, shmget};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    os::cleanup::{self, Slot},
    Error,
};

/// Size of the coverage map in bytes.
pub const MAP_SIZE: usize = 65536;

/// The env var an instrumented target reads the segment id from.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// The id describing a System V shared memory segment.
///
/// This is what ends up in [`SHM_ENV_VAR`], rendered as a decimal integer.
#[derive(Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ShMemId(i32);

impl ShMemId {
    /// Create a new id from an int
    #[must_use]
    pub const fn from_int(val: i32) -> Self {
        Self(val)
    }

    /// The raw os id, as passed to `shmat`/`shmctl`
    #[must_use]
    pub const fn as_int(&self) -> i32 {
        self.0
    }
}

impl Display for ShMemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ShMemId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: i32 = s.trim().parse()?;
        if id < 0 {
            return Err(Error::illegal_argument(format!(
                "Shared memory id must not be negative, got {id}"
            )));
        }
        Ok(Self(id))
    }
}

impl From<ShMemId> for i32 {
    fn from(id: ShMemId) -> i32 {
        id.0
    }
}

/// Returns `true` if the segment `id` is still allocated in the kernel.
#[must_use]
pub fn segment_exists(id: ShMemId) -> bool {
    let mut stat: libc::shmid_ds = unsafe { core::mem::zeroed() };
    unsafe { shmctl(id.as_int(), libc::IPC_STAT, &mut stat) != -1 }
}

/// How this process relates to the segment.
#[derive(Debug, Clone, Copy)]
enum Role {
    /// We created it and destroy it. `None` if the cleanup table was full.
    Owner(Option<Slot>),
    /// We only attached to it.
    Attached,
}

/// A live mapping of a [`MAP_SIZE`] coverage segment.
///
/// The harness side creates one with [`CoverageShMem::new`] and hands out its
/// [`CoverageShMem::id`] to children. Instrumented targets written in Rust attach with
/// [`CoverageShMem::from_env`]. Only the owner ever destroys the segment.
#[derive(Debug)]
pub struct CoverageShMem {
    id: ShMemId,
    /// `None` once released. Taking it is the single-shot release guard.
    map: Option<NonNull<u8>>,
    role: Role,
    zero: Box<[u8]>,
}

// The mapping is plain memory that nobody else in this process aliases.
unsafe impl Send for CoverageShMem {}

impl CoverageShMem {
    /// Create a new coverage map, using `shmget`/`shmat`.
    ///
    /// The segment is private to us (`IPC_PRIVATE`), created exclusively, and only
    /// readable and writable by our user. It is registered for removal at process exit.
    pub fn new() -> Result<Self, Error> {
        let os_id = unsafe {
            shmget(
                libc::IPC_PRIVATE,
                MAP_SIZE,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };
        if os_id < 0 {
            return Err(Error::last_os_error(format!(
                "Failed to allocate a shared mapping of size {MAP_SIZE} - check OS limits (i.e shmall, shmmax)"
            )));
        }
        let id = ShMemId::from_int(os_id);

        let map = match Self::attach(id) {
            Ok(map) => map,
            Err(err) => {
                unsafe { shmctl(os_id, libc::IPC_RMID, ptr::null_mut()) };
                return Err(err);
            }
        };
        let slot = cleanup::register(os_id);
        info!("Created coverage map {id} ({MAP_SIZE} bytes)");

        Ok(Self {
            id,
            map: Some(map),
            role: Role::Owner(slot),
            zero: vec![0; MAP_SIZE].into_boxed_slice(),
        })
    }

    /// Attach to an existing coverage map. Dropping the result only detaches.
    pub fn from_id(id: ShMemId) -> Result<Self, Error> {
        let map = Self::attach(id)?;
        debug!("Attached to coverage map {id}");
        Ok(Self {
            id,
            map: Some(map),
            role: Role::Attached,
            zero: vec![0; MAP_SIZE].into_boxed_slice(),
        })
    }

    /// Attach to the coverage map named by [`SHM_ENV_VAR`], the target side of the convention.
    pub fn from_env() -> Result<Self, Error> {
        let id: ShMemId = env::var(SHM_ENV_VAR)?.parse()?;
        Self::from_id(id)
    }

    fn attach(id: ShMemId) -> Result<NonNull<u8>, Error> {
        let map = unsafe { shmat(id.as_int(), ptr::null(), 0) };
        if map as isize == -1 {
            return Err(Error::last_os_error(format!(
                "Failed to map the shared mapping with id {id}"
            )));
        }
        NonNull::new(map.cast::<u8>())
            .ok_or_else(|| Error::resource(format!("shmat returned null for id {id}")))
    }

    /// The id to hand to children, see [`SHM_ENV_VAR`]
    #[must_use]
    pub fn id(&self) -> ShMemId {
        self.id
    }

    /// The size of the map, always [`MAP_SIZE`]
    #[must_use]
    #[allow(clippy::unused_self)]
    pub fn len(&self) -> usize {
        MAP_SIZE
    }

    /// Never empty, the map has a fixed size.
    #[must_use]
    #[allow(clippy::unused_self)]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `true` once [`CoverageShMem::release`] ran.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.map.is_none()
    }

    /// `true` if this mapping created the segment and will destroy it.
    #[must_use]
    pub fn is_owner(&self) -> bool {
        matches!(self.role, Role::Owner(_))
    }

    fn mapped(&self) -> Result<NonNull<u8>, Error> {
        self.map.ok_or_else(|| {
            Error::illegal_state(format!("Coverage map {} was already released", self.id))
        })
    }

    /// The current contents of the map.
    pub fn as_slice(&self) -> Result<&[u8], Error> {
        let map = self.mapped()?;
        // # Safety
        // `map` points to a live attachment of exactly MAP_SIZE bytes until release.
        Ok(unsafe { core::slice::from_raw_parts(map.as_ptr(), MAP_SIZE) })
    }

    /// The current contents of the map, mutable. This is how targets bump counters.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8], Error> {
        let map = self.mapped()?;
        Ok(unsafe { core::slice::from_raw_parts_mut(map.as_ptr(), MAP_SIZE) })
    }

    /// Zero the whole map, so no coverage of a previous run leaks into the next one.
    pub fn reset(&mut self) -> Result<(), Error> {
        let map = self.mapped()?;
        let live = unsafe { core::slice::from_raw_parts_mut(map.as_ptr(), MAP_SIZE) };
        live.copy_from_slice(&self.zero);
        Ok(())
    }

    /// An owned copy of the map, independent of later resets or the release of the segment.
    pub fn snapshot(&self) -> Result<CoverageSnapshot, Error> {
        Ok(CoverageSnapshot::from(self.as_slice()?))
    }

    /// Detach the mapping and, if we own it, destroy the segment.
    ///
    /// Calling this more than once is a no-op. If the exit or signal hook already
    /// destroyed the segment, this only detaches.
    pub fn release(&mut self) {
        let Some(map) = self.map.take() else {
            return;
        };

        if let Role::Owner(slot) = self.role {
            let ours = slot.map_or(true, |slot| cleanup::unregister(slot, self.id.as_int()));
            if ours {
                unsafe { shmctl(self.id.as_int(), libc::IPC_RMID, ptr::null_mut()) };
                info!("Removed coverage map {}", self.id);
            } else {
                debug!("Coverage map {} was already removed by the exit hook", self.id);
            }
        }

        unsafe { shmdt(map.as_ptr().cast::<c_void>().cast_const()) };
    }
}

impl Drop for CoverageShMem {
    fn drop(&mut self) {
        self.release();
    }
}

/// An owned, immutable copy of a coverage map.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    map: Box<[u8]>,
}

impl CoverageSnapshot {
    /// The raw bytes, one counter per edge
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    /// The number of counters
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// `true` if the snapshot holds no counters at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// How many edges were hit at least once
    #[must_use]
    pub fn count_nonzero(&self) -> usize {
        self.map.iter().filter(|&&b| b != 0).count()
    }

    /// `(offset, value)` for every edge that was hit
    pub fn iter_nonzero(&self) -> impl Iterator<Item = (usize, u8)> + '_ {
        self.map
            .iter()
            .enumerate()
            .filter(|(_, &b)| b != 0)
            .map(|(i, &b)| (i, b))
    }
}

impl From<&[u8]> for CoverageSnapshot {
    fn from(map: &[u8]) -> Self {
        Self { map: map.into() }
    }
}

impl AsRef<[u8]> for CoverageSnapshot {
    fn as_ref(&self) -> &[u8] {
        &self.map
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::{segment_exists, CoverageShMem, CoverageSnapshot, ShMemId, MAP_SIZE};
    use crate::{os::cleanup, Error};

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_shmem_roundtrip_through_attach() -> Result<(), Error> {
        let mut owner = CoverageShMem::new()?;
        assert!(owner.is_owner());
        let mut target = CoverageShMem::from_id(owner.id())?;
        assert!(!target.is_owner());

        target.as_mut_slice()?[0] = 1;
        target.as_mut_slice()?[MAP_SIZE - 1] = 255;
        drop(target);

        let snap = owner.snapshot()?;
        assert_eq!(snap.len(), MAP_SIZE);
        assert_eq!(snap.iter_nonzero().collect::<Vec<_>>(), vec![(0, 1), (MAP_SIZE - 1, 255)]);

        // detaching the target must not have destroyed the segment
        assert!(segment_exists(owner.id()));
        owner.reset()?;
        assert_eq!(owner.snapshot()?.count_nonzero(), 0);
        // the earlier snapshot is ours to keep
        assert_eq!(snap.count_nonzero(), 2);
        Ok(())
    }

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_release_is_idempotent() -> Result<(), Error> {
        let mut map = CoverageShMem::new()?;
        let id = map.id();
        assert!(segment_exists(id));

        map.release();
        assert!(map.is_released());
        assert!(!segment_exists(id));
        map.release();
        drop(map);

        Ok(())
    }

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_exit_hook_then_explicit_release() -> Result<(), Error> {
        let mut map = CoverageShMem::new()?;
        let id = map.id();

        // what the atexit hook runs
        assert!(cleanup::release_all() >= 1);

        // the segment is marked for removal, detaching must not remove it a second time
        map.release();
        assert!(map.is_released());
        assert!(!segment_exists(id));
        Ok(())
    }

    #[test]
    #[serial]
    #[cfg_attr(miri, ignore)]
    fn test_released_map_refuses_access() -> Result<(), Error> {
        let mut map = CoverageShMem::new()?;
        map.release();
        assert!(matches!(map.reset(), Err(Error::IllegalState(..))));
        assert!(map.snapshot().is_err());
        Ok(())
    }

    #[test]
    fn test_id_parsing() {
        let id: ShMemId = "1234\n".parse().unwrap();
        assert_eq!(id.as_int(), 1234);
        assert_eq!(id.to_string(), "1234");
        assert!("-1".parse::<ShMemId>().is_err());
        assert!("shm".parse::<ShMemId>().is_err());
    }

    #[test]
    fn test_snapshot_nonzero() {
        let snap = CoverageSnapshot::from(&[0, 3, 0, 0, 7][..]);
        assert_eq!(snap.count_nonzero(), 2);
        assert_eq!(snap.iter_nonzero().collect::<Vec<_>>(), vec![(1, 3), (4, 7)]);
    }
}
