//! Transaction ID generation.

use std::sync::atomic::{AtomicU64, Ordering};

/// A unique identifier for a transaction.
///
/// Carries no payload beyond identity; it correlates lock table entries,
/// log records, and dirty cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// A thread-safe transaction ID generator.
pub struct TransactionIdGenerator {
    next_id: AtomicU64,
}

impl TransactionIdGenerator {
    /// Creates a generator starting from 1.
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates a generator whose first ID is `first`. Used after reopening
    /// a database so that IDs never collide with ones already in the log.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next_id: AtomicU64::new(first.max(1)),
        }
    }

    /// Generates the next unique transaction ID.
    pub fn next(&self) -> TransactionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        TransactionId::new(id)
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", TransactionId::new(7)), "T7");
    }

    #[test]
    fn test_generator_is_sequential() {
        let generator = TransactionIdGenerator::new();
        assert_eq!(generator.next().value(), 1);
        assert_eq!(generator.next().value(), 2);
        assert_eq!(generator.next().value(), 3);
    }

    #[test]
    fn test_generator_reseed() {
        let generator = TransactionIdGenerator::starting_at(42);
        assert_eq!(generator.next().value(), 42);
        assert_eq!(generator.next().value(), 43);
    }

    #[test]
    fn test_generator_thread_safety() {
        use std::sync::Arc;
        use std::thread;

        let generator = Arc::new(TransactionIdGenerator::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let generator = Arc::clone(&generator);
            handles.push(thread::spawn(move || {
                (0..100).map(|_| generator.next().value()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
    }
}
