//! the test_utils folder here will share utils or test components between
//! unit tests
mod common;
mod fixtures;

pub use common::*;
pub use fixtures::*;
