//! Generic object pool.
//!
//! Caches previously allocated objects so the hot path does not allocate per
//! operation. Objects are constructed on demand from a fixed size parameter
//! and handed back with [`ObjectPool::put`].
//!
//! ## Off-cache rotation
//!
//! A pool created with [`ObjectPool::with_offcache`] keeps a ring of already
//! issued objects. Every `get()` hands out the oldest ring member and parks
//! the freshly obtained object at the back of the ring, so a buffer returned
//! to the pool is not handed to the transport again until it has cycled
//! through `offcache` other transfers.

use std::collections::{TryReserveError, VecDeque};
use std::fmt;
use tracing::warn;

/// An object that can be constructed by an [`ObjectPool`].
pub trait PoolItem: Sized {
    /// Construct a new instance with the pool's size parameter.
    fn allocate(size: usize) -> Result<Self, TryReserveError>;
}

impl PoolItem for Vec<u8> {
    fn allocate(size: usize) -> Result<Self, TryReserveError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size)?;
        buf.resize(size, 0);
        Ok(buf)
    }
}

/// Allocation failure inside a pool.
#[derive(Debug)]
pub struct PoolError {
    pool: &'static str,
    size: usize,
    source: TryReserveError,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to allocate {} bytes from {}: {}",
            self.size, self.pool, self.source
        )
    }
}

impl std::error::Error for PoolError {}

/// Pool of reusable objects of one kind.
pub struct ObjectPool<T: PoolItem> {
    name: &'static str,
    /// Construction parameter passed to `T::allocate`.
    item_size: usize,
    /// LIFO free list.
    free: Vec<T>,
    /// Off-cache ring (empty unless created with `with_offcache`).
    offcache: VecDeque<T>,
    /// Total objects ever constructed. Never decremented.
    allocated: usize,
}

impl<T: PoolItem> ObjectPool<T> {
    pub fn new(name: &'static str, item_size: usize) -> Self {
        Self {
            name,
            item_size,
            free: Vec::new(),
            offcache: VecDeque::new(),
            allocated: 0,
        }
    }

    /// Create a pool that rotates issued objects through a ring of `offcache`
    /// entries.
    pub fn with_offcache(
        name: &'static str,
        item_size: usize,
        offcache: usize,
    ) -> Result<Self, PoolError> {
        let mut pool = Self::new(name, item_size);
        for _ in 0..offcache {
            let item = pool.get_free()?;
            pool.offcache.push_back(item);
        }
        Ok(pool)
    }

    /// Take an object from the pool, constructing one if the free list is empty.
    pub fn get(&mut self) -> Result<T, PoolError> {
        let item = self.get_free()?;
        match self.offcache.pop_front() {
            Some(oldest) => {
                self.offcache.push_back(item);
                Ok(oldest)
            }
            None => Ok(item),
        }
    }

    /// Return an object to the pool.
    ///
    /// Double release is not detected.
    pub fn put(&mut self, item: T) {
        self.free.push(item);
    }

    fn get_free(&mut self) -> Result<T, PoolError> {
        if let Some(item) = self.free.pop() {
            return Ok(item);
        }

        let item = T::allocate(self.item_size).map_err(|source| PoolError {
            pool: self.name,
            size: self.item_size,
            source,
        })?;
        self.allocated += 1;
        Ok(item)
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Total objects constructed over the pool's lifetime.
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Objects currently held by the pool (free list and off-cache ring).
    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.free.len() + self.offcache.len()
    }

    /// Objects handed out and not yet returned.
    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.allocated - self.available()
    }
}

impl<T: PoolItem> Drop for ObjectPool<T> {
    fn drop(&mut self) {
        self.free.extend(self.offcache.drain(..));

        if self.allocated != self.free.len() {
            warn!(
                pool = self.name,
                leaked = self.allocated - self.free.len(),
                "objects were not released"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Item {
        id: usize,
    }

    impl PoolItem for Item {
        fn allocate(size: usize) -> Result<Self, TryReserveError> {
            Ok(Item { id: size })
        }
    }

    #[test]
    fn test_pool_reuses_released_objects() {
        let mut pool: ObjectPool<Vec<u8>> = ObjectPool::new("bytes", 64);

        let mut a = pool.get().unwrap();
        a[0] = 7;
        let b = pool.get().unwrap();
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.outstanding(), 2);

        pool.put(a);
        assert_eq!(pool.available(), 1);

        // LIFO reuse, no new allocation
        let c = pool.get().unwrap();
        assert_eq!(c[0], 7);
        assert_eq!(pool.allocated(), 2);

        pool.put(b);
        pool.put(c);
        assert_eq!(pool.available(), pool.allocated());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_allocation_count_never_decreases() {
        let mut pool: ObjectPool<Item> = ObjectPool::new("items", 1);
        let mut seen = 0;

        for round in 0..5 {
            let items: Vec<_> = (0..round).map(|_| pool.get().unwrap()).collect();
            assert!(pool.allocated() >= seen);
            seen = pool.allocated();
            for item in items {
                pool.put(item);
            }
        }

        assert_eq!(pool.allocated(), 4);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_offcache_delays_reuse() {
        let mut pool: ObjectPool<Vec<u8>> = ObjectPool::with_offcache("chunks", 8, 2).unwrap();
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.available(), 2);

        let mut first = pool.get().unwrap();
        first[0] = 1;
        pool.put(first);

        // The released buffer went to the free list, but the ring hands out
        // older buffers first.
        let second = pool.get().unwrap();
        assert_eq!(second[0], 0);
        let third = pool.get().unwrap();
        assert_eq!(third[0], 0);
        let fourth = pool.get().unwrap();
        assert_eq!(fourth[0], 1);

        pool.put(second);
        pool.put(third);
        pool.put(fourth);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_item_receives_size_parameter() {
        let mut pool: ObjectPool<Item> = ObjectPool::new("items", 42);
        let item = pool.get().unwrap();
        assert_eq!(item.id, 42);
        pool.put(item);
    }
}
