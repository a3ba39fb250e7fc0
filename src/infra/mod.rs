//! Infrastructure layer for the consent ledger
//!
//! Contains trait definitions and implementations for:
//! - Ledger storage (in-memory, SQLite)
//! - Released payload vaults
//! - Raw data sources
//! - Clocks and caller deadlines

mod clock;
mod deadline;
mod error;
mod memory;
pub mod sqlite;
mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use deadline::{ensure_before, within_deadline};
pub use error::*;
pub use memory::{MemoryDataSource, MemoryPayloadVault, MemoryStorage};
pub use sqlite::{SqlitePayloadVault, SqliteStorage};
pub use traits::*;
