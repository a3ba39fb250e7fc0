//! SQLite implementations of the persistence traits
//!
//! One transaction per commit; schema managed by embedded migrations.

mod storage;
mod vault;

pub use storage::*;
pub use vault::*;
