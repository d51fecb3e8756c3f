//! Content-addressed input materialization for the build worker.
//!
//! Sits between the remote content store and many concurrent build actions:
//! a single-flight, on-disk cache ([`DiskCache`]) plus the per-action driver
//! ([`materialize_inputs`]) that fans an input manifest out across it and
//! links the results into the action's sandbox.

mod disk;
mod error;
mod materialize;
mod remote;

#[cfg(test)]
pub(crate) mod testing;

pub use disk::DiskCache;
pub use error::{CacheError, Result};
pub use materialize::materialize_inputs;
pub use remote::{HttpStore, Store};
