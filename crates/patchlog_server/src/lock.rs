//! Log and store locking.
//!
//! Appends to one log are serialized by a [`LogLock`]: a reentrant
//! in-process mutex, optionally paired with a cross-process
//! [`DistributedLock`] for multi-server deployments. Nested acquisition on
//! the same thread is allowed; the cross-process component is acquired once
//! per outermost entry.

use crate::error::ServerResult;
use parking_lot::{Condvar, Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::cell::Cell;
use std::sync::Arc;

/// A mutual-exclusion primitive scoped to a named path.
///
/// The local implementation is a process-wide mutex; the coordination-backed
/// implementation holds a lease in the shared namespace. Either plugs into
/// [`LogLock`] without the index logic changing.
pub trait DistributedLock: Send + Sync {
    /// Blocks until the lock is held by this caller.
    fn acquire(&self) -> ServerResult<()>;

    /// Releases the lock.
    fn release(&self);

    /// The path this lock is scoped to.
    fn path(&self) -> &str;
}

/// A process-local [`DistributedLock`], appropriate for single-server
/// deployments.
pub struct ProcessLock {
    path: String,
    held: Mutex<bool>,
    cond: Condvar,
}

impl ProcessLock {
    /// Creates a lock scoped to `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            held: Mutex::new(false),
            cond: Condvar::new(),
        }
    }
}

impl DistributedLock for ProcessLock {
    fn acquire(&self) -> ServerResult<()> {
        let mut held = self.held.lock();
        while *held {
            self.cond.wait(&mut held);
        }
        *held = true;
        Ok(())
    }

    fn release(&self) {
        let mut held = self.held.lock();
        *held = false;
        self.cond.notify_one();
    }

    fn path(&self) -> &str {
        &self.path
    }
}

/// The exclusive lock guarding one log's sequencing operations.
///
/// Reentrant for the owning thread. The cross-process component, when
/// present, is taken on the outermost acquire and dropped on the outermost
/// release; the depth counter is only touched while the local mutex is held.
pub struct LogLock {
    local: ReentrantMutex<Cell<usize>>,
    dist: Option<Arc<dyn DistributedLock>>,
}

impl LogLock {
    /// A lock with no cross-process component.
    pub fn local_only() -> Self {
        Self {
            local: ReentrantMutex::new(Cell::new(0)),
            dist: None,
        }
    }

    /// A lock backed by a cross-process lock.
    pub fn with_distributed(dist: Arc<dyn DistributedLock>) -> Self {
        Self {
            local: ReentrantMutex::new(Cell::new(0)),
            dist: Some(dist),
        }
    }

    /// Acquires the lock, blocking other threads (and, with a distributed
    /// component, other processes) until the guard drops.
    pub fn acquire(&self) -> ServerResult<LogLockGuard<'_>> {
        let guard = self.local.lock();
        if guard.get() == 0 {
            if let Some(dist) = &self.dist {
                dist.acquire()?;
            }
        }
        guard.set(guard.get() + 1);
        Ok(LogLockGuard { guard, lock: self })
    }
}

/// Guard returned by [`LogLock::acquire`].
pub struct LogLockGuard<'a> {
    guard: ReentrantMutexGuard<'a, Cell<usize>>,
    lock: &'a LogLock,
}

impl Drop for LogLockGuard<'_> {
    fn drop(&mut self) {
        let depth = self.guard.get() - 1;
        self.guard.set(depth);
        if depth == 0 {
            if let Some(dist) = &self.lock.dist {
                dist.release();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn reentrant_same_thread() {
        let lock = LogLock::local_only();
        let _outer = lock.acquire().unwrap();
        let _inner = lock.acquire().unwrap();
    }

    #[test]
    fn distributed_component_taken_once_per_entry() {
        struct Counting {
            acquires: AtomicUsize,
            releases: AtomicUsize,
        }
        impl DistributedLock for Counting {
            fn acquire(&self) -> ServerResult<()> {
                self.acquires.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            fn release(&self) {
                self.releases.fetch_add(1, Ordering::SeqCst);
            }
            fn path(&self) -> &str {
                "/test"
            }
        }

        let counting = Arc::new(Counting {
            acquires: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        });
        let lock = LogLock::with_distributed(Arc::clone(&counting) as Arc<dyn DistributedLock>);

        {
            let _outer = lock.acquire().unwrap();
            let _inner = lock.acquire().unwrap();
            assert_eq!(counting.acquires.load(Ordering::SeqCst), 1);
        }
        assert_eq!(counting.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mutual_exclusion_across_threads() {
        let lock = Arc::new(LogLock::local_only());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let active = Arc::clone(&active);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..100 {
                        let _g = lock.acquire().unwrap();
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        active.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn process_lock_blocks() {
        let lock = Arc::new(ProcessLock::new("/store/lock"));
        lock.acquire().unwrap();

        let lock2 = Arc::clone(&lock);
        let handle = thread::spawn(move || {
            lock2.acquire().unwrap();
            lock2.release();
        });

        // The other thread cannot finish until we release.
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!handle.is_finished());
        lock.release();
        handle.join().unwrap();
    }
}
