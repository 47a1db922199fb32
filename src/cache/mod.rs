mod catalog_cache;
mod routing_table;


pub use catalog_cache::*;
pub use routing_table::*;
