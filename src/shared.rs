//! Shared state: secret rotation and the daemon/shim mapping — spec §3, §5, §9.
//!
//! `ServerState` holds the two rotating secrets. `FullState` is the
//! combination of `ServerState` and the `Cache` that a daemon and one or
//! more shims cooperate over. Spec §9 explicitly licenses, for a
//! single-process design, "a simple process-wide allocation with the
//! same ordering discipline" in place of a true cross-process mapping;
//! we take that option but still back it with a `memmap2` file so the
//! region has the create/attach split and on-disk persistence a real
//! multi-process deployment would need, and so the header/layout
//! discipline spec §9 asks for is exercised rather than assumed.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;

use crate::cache::Cache;
use crate::cookie::Secret;
use crate::entry::{CacheEntry, ENTRY_SIZE};
use crate::error::SharedStateError;

/// Magic value identifying a `cookieguard` shared region on disk.
const MAGIC: u32 = 0xC00C_1E00;
/// `magic(4) | cache_capacity(4) | rotation_period_secs(8) | current(32) |
/// previous(32) | rotate_at(8)`, followed by `cache_capacity` entry slots.
const HEADER_SIZE: usize = 4 + 4 + 8 + 32 + 32 + 8;

/// `{current_secret, previous_secret, rotate_at}` (spec §3).
pub struct ServerState {
    inner: RwLock<Secrets>,
    pub rotation_period_secs: u64,
}

struct Secrets {
    current: Secret,
    previous: Secret,
    rotate_at: u64,
}

impl ServerState {
    pub fn new(current: Secret, previous: Secret, rotate_at: u64, rotation_period_secs: u64) -> Self {
        Self {
            inner: RwLock::new(Secrets {
                current,
                previous,
                rotate_at,
            }),
            rotation_period_secs,
        }
    }

    /// Reconstruct from a previously-persisted `(current, previous,
    /// rotate_at)` triple, e.g. recovered from a shared region on attach.
    pub fn from_secrets(current: Secret, previous: Secret, rotate_at: u64, rotation_period_secs: u64) -> Self {
        Self::new(current, previous, rotate_at, rotation_period_secs)
    }

    pub fn fresh(rotation_period_secs: u64, now: u64) -> Self {
        let mut rng = rand::thread_rng();
        let mut current = [0u8; 32];
        let mut previous = [0u8; 32];
        rng.fill_bytes(&mut current);
        rng.fill_bytes(&mut previous);
        Self::new(current, previous, now + rotation_period_secs, rotation_period_secs)
    }

    /// Read the current/previous secret pair. Cheap and wait-free from the
    /// reader's perspective beyond the read-lock itself; per spec §5 a
    /// reader observing a torn update still sees two independently valid
    /// secrets.
    pub fn secrets(&self) -> (Secret, Secret) {
        let guard = self.inner.read();
        (guard.current, guard.previous)
    }

    pub fn rotate_at(&self) -> u64 {
        self.inner.read().rotate_at
    }

    /// If `now >= rotate_at`, rotate: `previous <- current; current <- fresh()`.
    /// Writes `previous` before `current`, matching spec §5's release order.
    pub fn maybe_rotate(&self, now: u64) -> bool {
        if now < self.rotate_at() {
            return false;
        }
        let mut fresh = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut fresh);

        let mut guard = self.inner.write();
        if now < guard.rotate_at {
            return false; // lost the race to another rotator
        }
        guard.previous = guard.current;
        guard.current = fresh;
        guard.rotate_at = now + self.rotation_period_secs;
        true
    }
}

/// The combination of secret state and cookie cache that a daemon and
/// shims cooperate over (spec §2, §3).
pub struct FullState {
    pub server: ServerState,
    pub cache: Cache,
}

impl FullState {
    pub fn new(server: ServerState, cache_capacity: usize) -> Self {
        Self {
            server,
            cache: Cache::new(cache_capacity),
        }
    }
}

/// Owns the backing `memmap2` file for a `FullState`.
///
/// The live, concurrently-mutated `FullState` lives in an in-process
/// `Arc`, matching the "process-wide allocation with the same ordering
/// discipline" option spec §9 names for single-process designs. The
/// mapping is not a passive bootstrap header, though: [`SharedRegion::sync`]
/// serializes the live secrets and cache entries into it using
/// [`CacheEntry::to_bytes`], and [`SharedRegion::attach`] recovers that
/// same state back out with [`CacheEntry::from_bytes`], so a daemon
/// restart observes the peers it already learned rather than resetting
/// them (spec §3: cache entries are "destroyed only by eviction or
/// explicit administrative clear").
pub struct SharedRegion {
    mmap: Mutex<MmapMut>,
    pub state: Arc<FullState>,
}

impl SharedRegion {
    /// Create (or truncate) the region at `path` and initialize a fresh
    /// `FullState`. Only the daemon should call this.
    pub fn create(
        path: &Path,
        cache_capacity: usize,
        rotation_period_secs: u64,
        now: u64,
    ) -> Result<Self, SharedStateError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| SharedStateError::CreateFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        file.set_len((HEADER_SIZE + cache_capacity * ENTRY_SIZE) as u64)
            .map_err(|e| SharedStateError::CreateFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| SharedStateError::CreateFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        };

        let server = ServerState::fresh(rotation_period_secs, now);
        let state = Arc::new(FullState::new(server, cache_capacity));

        let region = Self {
            mmap: Mutex::new(mmap),
            state,
        };
        region.sync();
        Ok(region)
    }

    /// Attach to an existing region created by [`SharedRegion::create`],
    /// validating the header and recovering its persisted secrets and
    /// cache entries.
    pub fn attach(path: &Path) -> Result<Self, SharedStateError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| SharedStateError::AttachFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| SharedStateError::AttachFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        };

        if mmap.len() < HEADER_SIZE {
            return Err(SharedStateError::IncompatibleLayout {
                path: path.display().to_string(),
                expected: MAGIC,
                got: 0,
            });
        }

        let magic = u32::from_le_bytes(mmap[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(SharedStateError::IncompatibleLayout {
                path: path.display().to_string(),
                expected: MAGIC,
                got: magic,
            });
        }
        let cache_capacity = u32::from_le_bytes(mmap[4..8].try_into().unwrap()) as usize;
        let rotation_period_secs = u64::from_le_bytes(mmap[8..16].try_into().unwrap());
        let current: Secret = mmap[16..48].try_into().unwrap();
        let previous: Secret = mmap[48..80].try_into().unwrap();
        let rotate_at = u64::from_le_bytes(mmap[80..88].try_into().unwrap());

        if mmap.len() < HEADER_SIZE + cache_capacity * ENTRY_SIZE {
            return Err(SharedStateError::IncompatibleLayout {
                path: path.display().to_string(),
                expected: MAGIC,
                got: magic,
            });
        }
        let entries = (0..cache_capacity).filter_map(|i| {
            let start = HEADER_SIZE + i * ENTRY_SIZE;
            let bytes: [u8; ENTRY_SIZE] = mmap[start..start + ENTRY_SIZE].try_into().unwrap();
            let entry = CacheEntry::from_bytes(&bytes);
            // A zeroed peer address marks an empty slot (spec §3: no valid
            // peer ever hashes to the unspecified address).
            if entry.peer().is_unspecified() {
                None
            } else {
                Some(entry)
            }
        });

        let server = ServerState::from_secrets(current, previous, rotate_at, rotation_period_secs);
        let cache = Cache::from_entries(cache_capacity, entries);
        let state = Arc::new(FullState { server, cache });

        Ok(Self {
            mmap: Mutex::new(mmap),
            state,
        })
    }

    /// Write the live secrets and cache entries into the mapping. Callers
    /// (the rotation task, the shutdown path) call this periodically so an
    /// attach after a restart recovers up-to-date state rather than
    /// whatever was live at `create` time.
    pub fn sync(&self) {
        let mut mmap = self.mmap.lock();
        let cache_capacity = self.state.cache.capacity() as u32;
        let (current, previous) = self.state.server.secrets();
        let rotate_at = self.state.server.rotate_at();

        mmap[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        mmap[4..8].copy_from_slice(&cache_capacity.to_le_bytes());
        mmap[8..16].copy_from_slice(&self.state.server.rotation_period_secs.to_le_bytes());
        mmap[16..48].copy_from_slice(&current);
        mmap[48..80].copy_from_slice(&previous);
        mmap[80..88].copy_from_slice(&rotate_at.to_le_bytes());

        for (i, entry) in self.state.cache.snapshot().into_iter().enumerate() {
            let start = HEADER_SIZE + i * ENTRY_SIZE;
            mmap[start..start + ENTRY_SIZE].copy_from_slice(&entry.to_bytes());
        }
        let _ = mmap.flush();
    }
}
