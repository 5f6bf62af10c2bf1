//! Hash collection aliases that switch between gxhash and std collections
//! based on the `gxhash` feature. Builds without AES-NI/SSE2 fall back to the
//! std hasher.

#[cfg(feature = "gxhash")]
pub use gxhash::{HashSet as GxHashSet, HashSetExt};

#[cfg(not(feature = "gxhash"))]
use std::collections::HashSet as StdHashSet;

/// HashSet using gxhash when available, std otherwise
#[cfg(feature = "gxhash")]
pub type HashSet<T> = GxHashSet<T>;

/// HashSet using gxhash when available, std otherwise
#[cfg(not(feature = "gxhash"))]
pub type HashSet<T> = StdHashSet<T>;

/// Set of record ids already visited by one traversal
pub type RecordIdSet = HashSet<u32>;

/// Extension trait for creating HashSet instances without a hasher argument
#[cfg(not(feature = "gxhash"))]
pub trait HashSetExt {
    /// Creates a new HashSet with default capacity
    fn new() -> Self;
}

#[cfg(not(feature = "gxhash"))]
impl<T> HashSetExt for StdHashSet<T> {
    fn new() -> Self {
        StdHashSet::new()
    }
}

/// Hasher used for the content store's concurrent maps
#[cfg(feature = "gxhash")]
pub use gxhash::GxBuildHasher;

/// Hasher used for the content store's concurrent maps
#[cfg(not(feature = "gxhash"))]
pub type GxBuildHasher = std::hash::RandomState;
