//! Bounded pools of reusable trace entities.
//!
//! Transactions, spans and errors are reference counted. When the last holder releases an
//! entity it is reset and offered back to its pool; a full pool simply drops it, and an
//! empty pool allocates. Neither case ever blocks the caller.
use crate::apm_error;
use crossbeam_queue::ArrayQueue;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Entities that can be returned to an [`ObjectPool`].
pub trait Recyclable {
    /// Number of outstanding references. Only entities at zero may be recycled.
    fn reference_count(&self) -> i64;

    /// Clears all state so that the instance looks freshly allocated.
    fn reset(&self);
}

/// Snapshot of pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Instances currently waiting in the pool.
    pub size: usize,
    /// Instances allocated because the pool was empty.
    pub objects_created: usize,
    /// Instances returned to the pool.
    pub recycled: usize,
    /// Returned instances dropped because the pool was full.
    pub dropped: usize,
}

type Allocator<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Lock-free pool with a fixed capacity.
pub struct ObjectPool<T> {
    name: &'static str,
    free: ArrayQueue<T>,
    allocator: Allocator<T>,
    objects_created: AtomicUsize,
    recycled: AtomicUsize,
    dropped: AtomicUsize,
}

impl<T: Recyclable> ObjectPool<T> {
    /// Creates an empty pool holding at most `capacity` instances.
    pub fn new(name: &'static str, capacity: usize, allocator: impl Fn() -> T + Send + Sync + 'static) -> Self {
        ObjectPool {
            name,
            free: ArrayQueue::new(capacity.max(1)),
            allocator: Box::new(allocator),
            objects_created: AtomicUsize::new(0),
            recycled: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Returns a pooled instance, or a new one if the pool is empty.
    pub fn acquire(&self) -> T {
        match self.free.pop() {
            Some(instance) => instance,
            None => {
                self.objects_created.fetch_add(1, Ordering::Relaxed);
                (self.allocator)()
            }
        }
    }

    /// Resets `instance` and returns it to the pool.
    ///
    /// Instances still referenced are refused and `false` is returned; they stay with
    /// their current holders instead of being handed out twice.
    pub fn recycle(&self, instance: T) -> bool {
        let references = instance.reference_count();
        if references != 0 {
            apm_error!(
                name: "ObjectPool.RecycleReferenced",
                pool = self.name,
                references = references,
            );
            return false;
        }
        instance.reset();
        self.recycled.fetch_add(1, Ordering::Relaxed);
        if self.free.push(instance).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Maximum number of pooled instances.
    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.free.len(),
            objects_created: self.objects_created.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.name)
            .field("size", &self.free.len())
            .field("capacity", &self.free.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::sync::Arc;
    use std::thread;

    #[derive(Debug, Default)]
    struct Entry {
        value: AtomicI64,
        references: AtomicI64,
    }

    impl Recyclable for Arc<Entry> {
        fn reference_count(&self) -> i64 {
            self.references.load(Ordering::Acquire)
        }

        fn reset(&self) {
            self.value.store(0, Ordering::Release);
        }
    }

    fn pool(capacity: usize) -> ObjectPool<Arc<Entry>> {
        ObjectPool::new("test", capacity, || Arc::new(Entry::default()))
    }

    #[test]
    fn allocates_on_miss_and_reuses() {
        let pool = pool(2);
        let first = pool.acquire();
        first.value.store(42, Ordering::Relaxed);
        assert_eq!(pool.stats().objects_created, 1);

        assert!(pool.recycle(first.clone()));
        assert_eq!(pool.stats().size, 1);

        let again = pool.acquire();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.value.load(Ordering::Relaxed), 0);
        assert_eq!(pool.stats().objects_created, 1);
    }

    #[test]
    fn refuses_referenced_instances() {
        let pool = pool(2);
        let entry = pool.acquire();
        entry.references.store(1, Ordering::Relaxed);
        entry.value.store(7, Ordering::Relaxed);
        assert!(!pool.recycle(entry.clone()));
        assert_eq!(entry.value.load(Ordering::Relaxed), 7);
        assert_eq!(pool.stats().size, 0);
    }

    #[test]
    fn drops_when_full() {
        let pool = pool(1);
        let a = pool.acquire();
        let b = pool.acquire();
        assert!(pool.recycle(a));
        assert!(pool.recycle(b));
        assert_eq!(
            pool.stats(),
            PoolStats {
                size: 1,
                objects_created: 2,
                recycled: 2,
                dropped: 1
            }
        );
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn never_hands_out_an_instance_twice() {
        let pool = Arc::new(pool(64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        let entry = pool.acquire();
                        assert_eq!(entry.references.fetch_add(1, Ordering::AcqRel), 0);
                        entry.references.fetch_sub(1, Ordering::AcqRel);
                        pool.recycle(entry);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.stats().objects_created <= 4);
    }
}
