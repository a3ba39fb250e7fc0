//! Domain types for the consent ledger

mod audit;
mod grant;
mod package;
mod request;
mod trust;
mod types;

pub use audit::*;
pub use grant::*;
pub use package::*;
pub use request::*;
pub use trust::*;
pub use types::*;
