//! Durable tier: a pluggable persistent store behind one interface.
//!
//! Three backends:
//! - [`LmdbStore`]: embedded single-writer store
//! - [`RemoteKvStore`]: remote key-value service over HTTP
//! - [`MemoryStore`]: process-local fallback
//!
//! [`DurableTier`] layers typed access, write routing, and degradation on top.

mod lmdb_backend;
mod memory;
mod remote_kv;
mod tier;
mod traits;

pub use lmdb_backend::LmdbStore;
pub use memory::MemoryStore;
pub use remote_kv::RemoteKvStore;
pub use tier::DurableTier;
pub use traits::{BackendKind, DurableStore};
