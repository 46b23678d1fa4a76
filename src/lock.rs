// Locking collaborator. The engine calls through the `Locker` trait at
// every suspension point; the default implementation coordinates threads
// within one process using parking_lot primitives. Cross-process lock
// services plug in by implementing the same trait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::lock_api::{RawMutex as _, RawRwLock as _};
use parking_lot::{Mutex, RawMutex, RawRwLock};

use crate::common::NUM_PARTITIONS;
use crate::error::{DbError, Result};

/// Lock granularity a handle is opened in. Modes cannot be mixed between
/// handles on the same file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// One lock serializing all mutators and observers.
    Exclusive,
    /// Many readers, writers exclusive.
    Shared,
    /// Independent mutexes keyed by `logical_page mod N`.
    Partitioned,
    /// Caller guarantees no concurrent access.
    None,
}

/// What a single acquire covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    /// The whole DB, exclusively.
    Db,
    /// The whole DB, shared with other readers.
    Read,
    /// One partition (partitioned mode only).
    Part(u32),
    /// The internal allocator lock.
    Internal,
}

pub trait Locker: Send + Sync {
    fn mode(&self) -> LockMode;

    /// Acquire. With `wait` false, returns Ok(false) instead of blocking.
    fn lock(&self, scope: LockScope, wait: bool) -> Result<bool>;

    fn unlock(&self, scope: LockScope) -> Result<()>;

    /// Does the calling thread own the whole DB exclusively?
    fn owned(&self) -> bool;

    /// Is any lock currently held by anyone?
    fn locked(&self) -> bool;

    /// Whether a previous owner died holding a lock. The engine runs an
    /// integrity check pass when this reports true at open.
    fn needs_check(&self) -> bool {
        false
    }

    /// Forcibly clear all lock state (operator intervention).
    fn reset(&self) {}
}

#[inline]
pub fn partition_of(logical_page: u32) -> u32 {
    logical_page % NUM_PARTITIONS
}

fn thread_token() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static TOKEN: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|t| *t)
}

/// Reentrant mutex with explicit lock/unlock, usable across call
/// boundaries (guards would not survive the engine's staged lock
/// hand-offs).
struct ReentrantLock {
    raw: RawMutex,
    owner: AtomicU64,
    depth: AtomicU32,
}

impl ReentrantLock {
    const fn new() -> ReentrantLock {
        ReentrantLock {
            raw: RawMutex::INIT,
            owner: AtomicU64::new(0),
            depth: AtomicU32::new(0),
        }
    }

    fn lock(&self) {
        let me = thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.raw.lock();
        self.owner.store(me, Ordering::Release);
        self.depth.store(1, Ordering::Relaxed);
    }

    fn try_lock(&self) -> bool {
        let me = thread_token();
        if self.owner.load(Ordering::Acquire) == me {
            self.depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        if !self.raw.try_lock() {
            return false;
        }
        self.owner.store(me, Ordering::Release);
        self.depth.store(1, Ordering::Relaxed);
        true
    }

    fn unlock(&self) -> Result<()> {
        let me = thread_token();
        if self.owner.load(Ordering::Acquire) != me {
            return Err(DbError::InvalidArg("unlock by non-owner".into()));
        }
        if self.depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.owner.store(0, Ordering::Release);
            // SAFETY: this thread holds the raw mutex (owner check above).
            unsafe { self.raw.unlock() };
        }
        Ok(())
    }

    fn owned(&self) -> bool {
        self.owner.load(Ordering::Acquire) == thread_token()
    }

    fn held(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }
}

/// In-process lock service shared by every handle open on the same file
/// path. Readers/writers in other processes need an external `Locker`.
pub struct ProcessLocker {
    mode: LockMode,
    db: ReentrantLock,
    rw: RawRwLock,
    rw_writer: AtomicU64,
    rw_writer_depth: AtomicU32,
    parts: Vec<ReentrantLock>,
    internal: ReentrantLock,
}

impl ProcessLocker {
    pub fn new(mode: LockMode) -> ProcessLocker {
        let nparts = if mode == LockMode::Partitioned {
            NUM_PARTITIONS as usize
        } else {
            0
        };
        let mut parts = Vec::with_capacity(nparts);
        for _ in 0..nparts {
            parts.push(ReentrantLock::new());
        }
        ProcessLocker {
            mode,
            db: ReentrantLock::new(),
            rw: RawRwLock::INIT,
            rw_writer: AtomicU64::new(0),
            rw_writer_depth: AtomicU32::new(0),
            parts,
            internal: ReentrantLock::new(),
        }
    }

    /// Look up (or create) the shared lock service for a path. Two handles
    /// opened on the same file in one process must agree on the mode.
    pub fn open(path: &Path, mode: LockMode) -> Result<Arc<ProcessLocker>> {
        static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Arc<ProcessLocker>>>> =
            Lazy::new(|| Mutex::new(HashMap::new()));

        let key = path.to_path_buf();
        let mut reg = REGISTRY.lock();
        if let Some(locker) = reg.get(&key) {
            if locker.mode != mode {
                return Err(DbError::InvalidArg(format!(
                    "lock mode mismatch for {}: open with {:?}, existing {:?}",
                    path.display(),
                    mode,
                    locker.mode
                )));
            }
            return Ok(Arc::clone(locker));
        }
        let locker = Arc::new(ProcessLocker::new(mode));
        reg.insert(key, Arc::clone(&locker));
        Ok(locker)
    }

    fn lock_exclusive_rw(&self, wait: bool) -> bool {
        let me = thread_token();
        if self.rw_writer.load(Ordering::Acquire) == me {
            self.rw_writer_depth.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let got = if wait {
            self.rw.lock_exclusive();
            true
        } else {
            self.rw.try_lock_exclusive()
        };
        if got {
            self.rw_writer.store(me, Ordering::Release);
            self.rw_writer_depth.store(1, Ordering::Relaxed);
        }
        got
    }

    fn unlock_exclusive_rw(&self) -> Result<()> {
        let me = thread_token();
        if self.rw_writer.load(Ordering::Acquire) != me {
            return Err(DbError::InvalidArg("unlock by non-owner".into()));
        }
        if self.rw_writer_depth.fetch_sub(1, Ordering::Relaxed) == 1 {
            self.rw_writer.store(0, Ordering::Release);
            // SAFETY: this thread holds the exclusive side (owner check above).
            unsafe { self.rw.unlock_exclusive() };
        }
        Ok(())
    }

    fn lock_all_parts(&self, wait: bool) -> bool {
        for (i, p) in self.parts.iter().enumerate() {
            let got = if wait { p.lock(); true } else { p.try_lock() };
            if !got {
                for q in self.parts[..i].iter().rev() {
                    let _ = q.unlock();
                }
                return false;
            }
        }
        true
    }
}

impl Locker for ProcessLocker {
    fn mode(&self) -> LockMode {
        self.mode
    }

    fn lock(&self, scope: LockScope, wait: bool) -> Result<bool> {
        let got = match (scope, self.mode) {
            (LockScope::Internal, _) => {
                if wait {
                    self.internal.lock();
                    true
                } else {
                    self.internal.try_lock()
                }
            }
            (_, LockMode::None) => true,
            (LockScope::Db, LockMode::Partitioned) => self.lock_all_parts(wait),
            (LockScope::Db, LockMode::Shared) => self.lock_exclusive_rw(wait),
            (LockScope::Read, LockMode::Shared) => {
                if wait {
                    self.rw.lock_shared();
                    true
                } else {
                    self.rw.try_lock_shared()
                }
            }
            (LockScope::Part(p), LockMode::Partitioned) => {
                let l = &self.parts[p as usize % self.parts.len()];
                if wait {
                    l.lock();
                    true
                } else {
                    l.try_lock()
                }
            }
            // Exclusive mode, and narrower scopes degraded to the single lock.
            _ => {
                if self.mode == LockMode::Shared {
                    self.lock_exclusive_rw(wait)
                } else if wait {
                    self.db.lock();
                    true
                } else {
                    self.db.try_lock()
                }
            }
        };
        Ok(got)
    }

    fn unlock(&self, scope: LockScope) -> Result<()> {
        match (scope, self.mode) {
            (LockScope::Internal, _) => self.internal.unlock(),
            (_, LockMode::None) => Ok(()),
            (LockScope::Db, LockMode::Partitioned) => {
                for p in self.parts.iter().rev() {
                    p.unlock()?;
                }
                Ok(())
            }
            (LockScope::Read, LockMode::Shared) => {
                // SAFETY: caller acquired the shared side via this scope.
                unsafe { self.rw.unlock_shared() };
                Ok(())
            }
            (LockScope::Part(p), LockMode::Partitioned) => {
                self.parts[p as usize % self.parts.len()].unlock()
            }
            _ => {
                if self.mode == LockMode::Shared {
                    self.unlock_exclusive_rw()
                } else {
                    self.db.unlock()
                }
            }
        }
    }

    fn owned(&self) -> bool {
        match self.mode {
            LockMode::None => true,
            LockMode::Exclusive => self.db.owned(),
            LockMode::Shared => self.rw_writer.load(Ordering::Acquire) == thread_token(),
            LockMode::Partitioned => self.parts.iter().all(|p| p.owned()),
        }
    }

    fn locked(&self) -> bool {
        match self.mode {
            LockMode::None => false,
            LockMode::Exclusive => self.db.held(),
            LockMode::Shared => self.rw_writer.load(Ordering::Acquire) != 0,
            LockMode::Partitioned => self.parts.iter().any(|p| p.held()),
        }
    }
}
