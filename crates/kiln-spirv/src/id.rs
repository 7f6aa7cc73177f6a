//! Result-id allocation.

use std::fmt;
use std::sync::Mutex;

/// A SPIR-V result id.
///
/// Ids are unique for the lifetime of one compilation and never reused.
/// The value 0 is reserved as "invalid/unset"; [`IdAllocator`] starts at 1.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Id(pub(crate) u32);

impl Id {
    /// The reserved invalid id.
    pub const INVALID: Self = Self(0);

    /// Returns `true` if this is the reserved invalid id.
    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues strictly increasing, never-repeating ids.
///
/// The counter sits behind a mutex so a host embedding the compiler in a
/// concurrent pipeline can share the allocator across threads.
#[derive(Debug)]
pub struct IdAllocator {
    next: Mutex<u32>,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    /// Creates an allocator whose first id is 1.
    pub fn new() -> Self {
        Self {
            next: Mutex::new(1),
        }
    }

    /// Allocates the next id.
    ///
    /// # Panics
    ///
    /// Panics on exhaustion of the 32-bit id space. That is a compiler
    /// bug, not an input condition: no realistic graph comes close.
    pub fn next(&self) -> Id {
        let mut next = self.next.lock().expect("id allocator poisoned");
        let id = *next;
        *next = next
            .checked_add(1)
            .unwrap_or_else(|| panic!("id space exhausted at {id}"));
        Id(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let alloc = IdAllocator::new();
        let a = alloc.next();
        let b = alloc.next();
        let c = alloc.next();
        assert!(a < b && b < c);
        assert_eq!(a, Id(1));
    }

    #[test]
    fn zero_is_invalid() {
        assert!(Id::INVALID.is_invalid());
        let alloc = IdAllocator::new();
        assert!(!alloc.next().is_invalid());
    }

    #[test]
    fn shared_across_threads() {
        use std::sync::Arc;

        let alloc = Arc::new(IdAllocator::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let alloc = Arc::clone(&alloc);
            handles.push(std::thread::spawn(move || {
                (0..100).map(|_| alloc.next().0).collect::<Vec<_>>()
            }));
        }
        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 400, "no id may be issued twice");
    }
}
