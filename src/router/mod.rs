//! Routing front end: targets operations from a cached routing table and
//! retries on staleness signals.

mod registry;
mod router;
mod transaction;


pub use registry::*;
pub use router::*;
pub use transaction::*;
