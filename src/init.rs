//! One-time, process-wide TLS library initialization.

use crate::backend::{Backend, RustlsBackend};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use thiserror::Error;
use tracing::{debug, warn};

/// Mode bit requesting that a lock be taken. Without it the lock is released.
pub const LOCK: i32 = 0x01;
/// Mode bit for releasing a lock.
pub const UNLOCK: i32 = 0x02;
/// Mode bit for shared access. Treated like exclusive access.
pub const READ: i32 = 0x04;
/// Mode bit for exclusive access.
pub const WRITE: i32 = 0x08;

/// Error returned by [`Initializer::ensure_initialized`].
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("Installed TLS library lacks the required thread support!")]
    NoThreadSupport,
    #[error("TLS library initialization failed: {0}")]
    Library(String),
}

#[derive(Debug, Default)]
struct Slot {
    held: Mutex<bool>,
    released: Condvar,
}

/// Locks handed out to a library that cannot synchronize itself.
///
/// The library takes and drops a lock in separate calls, so each slot is a
/// binary semaphore rather than a guard-based mutex.
#[derive(Debug)]
pub struct LockTable {
    slots: Box<[Slot]>,
}

impl LockTable {
    fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| Slot::default()).collect(),
        }
    }

    /// Number of locks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table holds no locks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Blocks until lock `n` is free, then takes it.
    pub fn lock(&self, n: usize) {
        let Some(slot) = self.slot(n) else { return };
        let mut held = slot.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            held = slot
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *held = true;
    }

    /// Releases lock `n`.
    pub fn unlock(&self, n: usize) {
        let Some(slot) = self.slot(n) else { return };
        *slot.held.lock().unwrap_or_else(PoisonError::into_inner) = false;
        slot.released.notify_one();
    }

    fn slot(&self, n: usize) -> Option<&Slot> {
        let slot = self.slots.get(n);
        if slot.is_none() {
            warn!("Lock index {n} out of range ({} locks)", self.slots.len());
        }
        slot
    }
}

/// Callbacks installed into libraries that need external locking.
#[derive(Debug, Clone)]
pub struct LockingCallbacks {
    table: Arc<LockTable>,
}

impl LockingCallbacks {
    /// Locking callback: takes lock `n` when `mode` has [`LOCK`] set,
    /// releases it otherwise.
    pub fn locking(&self, mode: i32, n: usize) {
        if mode & LOCK != 0 {
            self.table.lock(n);
        } else {
            self.table.unlock(n);
        }
    }

    /// Thread-id callback. Returns [`current_thread_id`]: a process-local
    /// number rather than the OS thread id, which the locking contract only
    /// needs to be stable per thread and distinct between live threads.
    #[must_use]
    pub fn thread_id(&self) -> u64 {
        current_thread_id()
    }

    /// The locks behind [`Self::locking`].
    #[must_use]
    pub fn table(&self) -> &LockTable {
        &self.table
    }
}

/// Numeric identifier of the calling thread, stable for its lifetime and
/// never reused within the process.
///
/// Ids are handed out from a process-wide counter on first use, so they do
/// not match `gettid` or `pthread_self`.
#[must_use]
pub fn current_thread_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: Cell<u64> = const { Cell::new(0) };
    }
    ID.with(|id| {
        if id.get() == 0 {
            id.set(NEXT.fetch_add(1, Ordering::Relaxed));
        }
        id.get()
    })
}

/// Runs a [`Backend`]'s one-time setup exactly once.
pub struct Initializer {
    backend: Arc<dyn Backend>,
    mutex: Mutex<()>,
    done: AtomicBool,
    locks: OnceLock<Arc<LockTable>>,
}

impl Initializer {
    /// Creates an initializer for `backend`. Nothing runs until
    /// [`Self::ensure_initialized`].
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            mutex: Mutex::new(()),
            done: AtomicBool::new(false),
            locks: OnceLock::new(),
        }
    }

    /// The process-wide initializer, backed by [`RustlsBackend`].
    #[must_use]
    pub fn global() -> &'static Arc<Initializer> {
        static GLOBAL: OnceLock<Arc<Initializer>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Initializer::new(Arc::new(RustlsBackend))))
    }

    /// The library being initialized.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Whether setup has completed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Locks installed for a library needing external locking.
    #[must_use]
    pub fn lock_table(&self) -> Option<&LockTable> {
        self.locks.get().map(AsRef::as_ref)
    }

    /// Performs setup on the first call; later calls return immediately.
    ///
    /// A refusal leaves the initializer untouched, so it is reported again
    /// on the next call.
    pub fn ensure_initialized(&self) -> Result<(), InitError> {
        let _guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.backend.thread_support() {
            return Err(InitError::NoThreadSupport);
        }
        self.backend.initialize()?;
        if self.backend.capabilities().external_locking {
            let n = self.backend.num_locks();
            if n > 0 {
                let table = Arc::clone(self.locks.get_or_init(|| Arc::new(LockTable::new(n))));
                self.backend.install_locking(LockingCallbacks { table });
                debug!("Installed {n} TLS library locks");
            }
        }
        self.done.store(true, Ordering::Release);
        debug!("TLS library initialized");
        Ok(())
    }
}

/// Initializes the process-wide TLS library.
pub fn ensure_initialized() -> Result<(), InitError> {
    Initializer::global().ensure_initialized()
}

/// Forces process-wide initialization, surfacing a refusal.
pub fn init() -> Result<(), InitError> {
    ensure_initialized()
}
