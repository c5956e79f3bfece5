//! cachified Core - Entry Types and Policies
//!
//! Pure data structures shared by every cachified crate: cache entries and
//! their freshness rules, the durable record format, per-call policies,
//! timing samples, and configuration. No I/O lives here.

pub mod clock;
pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod policy;
pub mod request;
pub mod timing;

pub use clock::{Clock, SystemClock};
pub use codec::{decode_value, encode_value, Binary, BINARY_TAG};
pub use config::{EngineConfig, ForwardingConfig, RemoteKvConfig, INSTANCE_PLACEHOLDER};
pub use entry::{CacheEntry, CacheMetadata, DurableRecord, EntryState, Ttl};
pub use error::{BoxError, CacheError, CacheResult, CodecError, ConfigError, StorageError};
pub use policy::{split_key_list, CachePolicy, CacheValue, ForceFresh, ProduceFuture, Produced};
pub use request::{Principal, RequestContext};
pub use timing::{combine_server_timings, TimingSample, Timings};
