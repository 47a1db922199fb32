//! Shard-side state: documents, the persisted routing cache, critical
//! sections, transaction participation and migration bookkeeping.

mod critical_section;
mod local_cache;
mod migration_source;
mod participant;
mod range_deleter;
mod recovery;
mod request;
mod shard_server;
mod storage;


pub use critical_section::*;
pub use local_cache::*;
pub use migration_source::*;
pub use participant::*;
pub use range_deleter::*;
pub use recovery::*;
pub use request::*;
pub use shard_server::*;
pub use storage::*;
