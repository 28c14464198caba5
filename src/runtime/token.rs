//! Operation token tracking for completion correlation.
//!
//! Each request submitted to the transport carries a token (a `u64`) that
//! identifies the operation and its resources when the completion arrives.
//! Multi-chunk transfers share one token and count arrivals with a
//! [`JoinCounter`].

use slab::Slab;

use super::transport::TransportError;

/// Allocator for operation tokens with O(1) lookup.
///
/// Uses a slab to allocate and deallocate tokens, providing stable
/// identifiers for in-flight operations.
pub struct TokenAllocator<T> {
    ops: Slab<T>,
}

impl<T> TokenAllocator<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    /// The token the next `alloc` will return.
    pub fn next_token(&self) -> u64 {
        self.ops.vacant_key() as u64
    }

    /// Allocate a new token for an operation.
    pub fn alloc(&mut self, op: T) -> u64 {
        self.ops.insert(op) as u64
    }

    pub fn get_mut(&mut self, token: u64) -> Option<&mut T> {
        self.ops.get_mut(token as usize)
    }

    /// Free a token, making it available for reuse.
    ///
    /// Returns the operation that was associated with the token.
    pub fn free(&mut self, token: u64) -> Option<T> {
        self.ops.try_remove(token as usize)
    }

    /// Number of currently allocated tokens.
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Completion counter for a request split into several transport operations.
///
/// The first failure is retained; the request completes once every part
/// has reported back, successful or not.
#[derive(Debug)]
pub struct JoinCounter {
    expected: usize,
    completed: usize,
    error: Option<TransportError>,
}

impl JoinCounter {
    pub fn new(expected: usize) -> Self {
        assert!(expected > 0, "join over zero operations");
        Self {
            expected,
            completed: 0,
            error: None,
        }
    }

    /// Record one completion. Returns `true` when all parts have arrived.
    pub fn arrive(&mut self, error: Option<TransportError>) -> bool {
        assert!(self.completed < self.expected, "too many completions");
        self.completed += 1;
        if self.error.is_none() {
            self.error = error;
        }
        self.completed == self.expected
    }

    pub fn completed(&self) -> usize {
        self.completed
    }

    pub fn error(&self) -> Option<&TransportError> {
        self.error.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Op {
        Accept,
        Read { conn_id: usize },
    }

    #[test]
    fn test_token_allocator() {
        let mut alloc = TokenAllocator::new(16);

        let t1 = alloc.alloc(Op::Accept);
        let t2 = alloc.alloc(Op::Read { conn_id: 1 });

        assert_eq!(alloc.len(), 2);
        assert_eq!(alloc.get_mut(t1), Some(&mut Op::Accept));
        assert_eq!(alloc.get_mut(t2), Some(&mut Op::Read { conn_id: 1 }));

        assert_eq!(alloc.free(t1), Some(Op::Accept));
        assert!(alloc.get_mut(t1).is_none());
        assert!(alloc.free(t1).is_none());
        assert_eq!(alloc.len(), 1);

        // Slab reuses slots
        assert_eq!(alloc.next_token(), t1);
        let t3 = alloc.alloc(Op::Accept);
        assert_eq!(t3, t1);
    }

    #[test]
    fn test_join_counter_keeps_first_error() {
        let mut join = JoinCounter::new(3);

        assert!(!join.arrive(None));
        assert!(!join.arrive(Some(TransportError::Canceled)));
        assert!(join.arrive(Some(TransportError::TimedOut)));

        assert_eq!(join.completed(), 3);
        assert_eq!(join.error(), Some(&TransportError::Canceled));
    }

    #[test]
    fn test_join_counter_single() {
        let mut join = JoinCounter::new(1);
        assert!(join.arrive(None));
        assert!(join.error().is_none());
    }
}
