//! Chunked transfer buffers.
//!
//! A data transfer of `data_size` bytes is carried by a `BufferSet`: an
//! ordered chain of pooled chunks, each at most `chunk_size` bytes. Every
//! chunk but the last is full. Chunks are posted to the transport one by one.
//! Payload content is generated chunk by chunk, each chunk continuing the
//! generator seed left by the previous one, so a chunk whose size is not a
//! multiple of 8 ends in its own byte tail.

use std::collections::TryReserveError;

use super::pool::{ObjectPool, PoolError, PoolItem};
use crate::random;

/// One pooled segment of a transfer.
///
/// The backing allocation always has the pool's chunk capacity; `size` is
/// the part in use for the current transfer.
#[derive(Debug)]
pub struct Chunk {
    data: Vec<u8>,
    size: usize,
}

impl PoolItem for Chunk {
    fn allocate(capacity: usize) -> Result<Self, TryReserveError> {
        let data = Vec::<u8>::allocate(capacity)?;
        Ok(Self {
            size: data.len(),
            data,
        })
    }
}

impl Chunk {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn resize(&mut self, size: usize) {
        assert!(size <= self.capacity(), "chunk overflow");
        self.size = size;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.size]
    }

    /// Replace the chunk content with received bytes.
    pub fn store(&mut self, data: &[u8]) {
        self.resize(data.len());
        self.data[..data.len()].copy_from_slice(data);
    }
}

/// Number of chunks needed to carry `data_size` bytes.
pub fn chunk_count(data_size: usize, chunk_size: usize) -> usize {
    data_size.div_ceil(chunk_size)
}

/// A chain of chunks describing one transfer.
#[derive(Debug, Default)]
pub struct BufferSet {
    chunks: Vec<Chunk>,
    data_size: usize,
}

impl PoolItem for BufferSet {
    fn allocate(_: usize) -> Result<Self, TryReserveError> {
        Ok(Self::default())
    }
}

impl BufferSet {
    /// Populate an empty set with enough chunks for `data_size` bytes.
    ///
    /// When `fill` is set the chunks receive the stream seeded by `sn`.
    pub fn init(
        &mut self,
        data_size: usize,
        chunk_pool: &mut ObjectPool<Chunk>,
        sn: u32,
        fill: bool,
    ) -> Result<(), PoolError> {
        assert!(self.chunks.is_empty(), "buffer set already initialized");

        let chunk_size = chunk_pool.item_size();
        let mut remaining = data_size;
        while remaining > 0 {
            let mut chunk = match chunk_pool.get() {
                Ok(chunk) => chunk,
                Err(e) => {
                    for chunk in self.chunks.drain(..) {
                        chunk_pool.put(chunk);
                    }
                    return Err(e);
                }
            };
            let size = remaining.min(chunk_size);
            chunk.resize(size);
            remaining -= size;
            self.chunks.push(chunk);
        }
        self.data_size = data_size;

        if fill {
            self.fill(sn);
        }
        Ok(())
    }

    /// Number of chunks in the chain.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Total bytes described by the chain.
    pub fn data_size(&self) -> usize {
        self.data_size
    }

    #[cfg(test)]
    pub fn chunk(&self, idx: usize) -> &Chunk {
        &self.chunks[idx]
    }

    pub fn chunk_mut(&mut self, idx: usize) -> &mut Chunk {
        &mut self.chunks[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    /// Write the deterministic stream for `sn` across all chunks.
    pub fn fill(&mut self, sn: u32) {
        let mut seed = sn;
        for chunk in &mut self.chunks {
            random::fill(&mut seed, chunk.as_mut_slice());
        }
    }

    /// Offset of the first byte that differs from the stream for `sn`,
    /// counted from the start of the transfer.
    ///
    /// A chain holding fewer bytes than `data_size` mismatches at its end.
    pub fn first_mismatch(&self, sn: u32) -> Option<usize> {
        let mut seed = sn;
        let mut offset = 0;
        for chunk in &self.chunks {
            let data = chunk.as_slice();
            let valid = random::validate(&mut seed, data);
            if valid < data.len() {
                return Some(offset + valid);
            }
            offset += data.len();
        }
        (offset != self.data_size).then_some(offset)
    }

    /// Hand every chunk back to `chunk_pool` and the empty set to `set_pool`.
    pub fn release(mut self, chunk_pool: &mut ObjectPool<Chunk>, set_pool: &mut ObjectPool<BufferSet>) {
        for chunk in self.chunks.drain(..) {
            chunk_pool.put(chunk);
        }
        self.data_size = 0;
        set_pool.put(self);
    }
}

/// Pools backing data transfers: chain descriptors and chunk storage.
pub struct BufferPools {
    sets: ObjectPool<BufferSet>,
    chunks: ObjectPool<Chunk>,
}

impl BufferPools {
    /// Create the pools. With `offcache > 0` chunk reuse is delayed through
    /// an off-cache ring of that many chunks.
    pub fn new(chunk_size: usize, offcache: usize) -> Result<Self, PoolError> {
        let chunks = if offcache > 0 {
            ObjectPool::with_offcache("chunks", chunk_size, offcache)?
        } else {
            ObjectPool::new("chunks", chunk_size)
        };
        Ok(Self {
            sets: ObjectPool::new("buffer sets", 0),
            chunks,
        })
    }

    /// Get a set covering `data_size` bytes, filled with the stream for `sn`
    /// when `fill` is set.
    pub fn acquire(&mut self, data_size: usize, sn: u32, fill: bool) -> Result<BufferSet, PoolError> {
        let mut set = self.sets.get()?;
        if let Err(e) = set.init(data_size, &mut self.chunks, sn, fill) {
            self.sets.put(set);
            return Err(e);
        }
        Ok(set)
    }

    pub fn release(&mut self, set: BufferSet) {
        set.release(&mut self.chunks, &mut self.sets);
    }

    /// Chunks handed out and not yet returned.
    #[cfg(test)]
    pub fn chunks_outstanding(&self) -> usize {
        self.chunks.outstanding()
    }

    /// Buffer sets constructed over the pools' lifetime.
    pub fn sets_allocated(&self) -> usize {
        self.sets.allocated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(4096, 1024), 4);
        assert_eq!(chunk_count(4097, 1024), 5);
        assert_eq!(chunk_count(1, 1024), 1);
        assert_eq!(chunk_count(0, 1024), 0);
    }

    #[test]
    fn test_buffer_set_splits_into_chunks() {
        let mut pools = BufferPools::new(1024, 0).unwrap();

        let set = pools.acquire(4096, 1, false).unwrap();
        assert_eq!(set.len(), 4);
        assert!(set.iter().all(|c| c.size() == 1024));
        pools.release(set);

        let set = pools.acquire(4097, 1, false).unwrap();
        let sizes: Vec<_> = set.iter().map(|c| c.size()).collect();
        assert_eq!(sizes, vec![1024, 1024, 1024, 1024, 1]);
        assert_eq!(set.data_size(), 4097);
        pools.release(set);

        assert_eq!(pools.chunks_outstanding(), 0);
    }

    /// Per-chunk fill of `sizes` with the seed carried between chunks.
    fn chunked_stream(sn: u32, sizes: &[usize]) -> Vec<Vec<u8>> {
        let mut seed = sn;
        sizes
            .iter()
            .map(|&size| {
                let mut data = vec![0u8; size];
                random::fill(&mut seed, &mut data);
                data
            })
            .collect()
    }

    #[test]
    fn test_buffer_set_seed_carries_across_chunks() {
        let mut pools = BufferPools::new(100, 0).unwrap();
        let set = pools.acquire(250, 77, true).unwrap();

        let expected = chunked_stream(77, &[100, 100, 50]);
        let chunks: Vec<Vec<u8>> = set.iter().map(|c| c.as_slice().to_vec()).collect();
        assert_eq!(chunks, expected);

        // Not the same as one contiguous fill: each chunk has its own tail
        let mut whole = vec![0u8; 250];
        random::fill(&mut 77, &mut whole);
        assert_ne!(chunks.concat(), whole);

        assert_eq!(set.first_mismatch(77), None);
        assert!(set.first_mismatch(78).is_some());
        pools.release(set);
    }

    #[test]
    fn test_buffer_set_reports_transfer_offset() {
        let mut pools = BufferPools::new(100, 0).unwrap();
        let mut set = pools.acquire(250, 5, true).unwrap();

        set.chunk_mut(2).as_mut_slice()[10] ^= 0x55;
        assert_eq!(set.first_mismatch(5), Some(210));
        pools.release(set);
    }

    #[test]
    fn test_short_chunk_is_a_mismatch() {
        let mut pools = BufferPools::new(100, 0).unwrap();
        let mut set = pools.acquire(150, 9, true).unwrap();

        let short = set.chunk(1).as_slice()[..20].to_vec();
        set.chunk_mut(1).store(&short);

        // A 20-byte chunk is checked against a fresh 20-byte fill
        let refill = chunked_stream(9, &[100, 20]);
        let expected = short
            .iter()
            .zip(&refill[1])
            .position(|(a, b)| a != b)
            .map_or(120, |pos| 100 + pos);
        assert_eq!(set.first_mismatch(9), Some(expected));

        // Restored to full length by a later transfer
        pools.release(set);
        let set = pools.acquire(200, 9, false).unwrap();
        assert!(set.iter().all(|c| c.size() == 100));
        pools.release(set);
    }

    #[test]
    fn test_release_returns_every_chunk() {
        let mut pools = BufferPools::new(64, 4).unwrap();

        let a = pools.acquire(200, 1, true).unwrap();
        let b = pools.acquire(64, 2, true).unwrap();
        assert_eq!(pools.chunks_outstanding(), 5);

        pools.release(a);
        pools.release(b);
        assert_eq!(pools.chunks_outstanding(), 0);

        // Reused sets come back empty
        let c = pools.acquire(10, 3, false).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.chunk(0).capacity(), 64);
        pools.release(c);
    }
}
