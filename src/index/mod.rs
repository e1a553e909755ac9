//! The in-memory bucket hash index: a fixed table of lazily-allocated
//! hash chains mapping a key to its most recent location in the data log.

mod bucket;

pub use bucket::{BucketArray, IndexEntry};
