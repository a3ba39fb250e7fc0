//! Data packaging
//!
//! Transforms a user's raw data to the effective anonymization level,
//! verifies the result before release, and issues a time-bounded access
//! token together with a delivery receipt.

mod anonymize;
mod pipeline;
mod schema;

pub use anonymize::{
    generalize_age, generalize_numeric, generalize_zip, mask, round_coordinate, truncate_date,
    DatePrecision, MaskStyle,
};
pub use pipeline::{PackagingDeps, PackagingPipeline};
pub use schema::{FieldClass, Generalization, SchemaRegistry};
