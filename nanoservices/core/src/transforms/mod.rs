pub mod dbt;
pub mod traits;

pub use dbt::DbtRunner;
pub use traits::{TransformOutcome, TransformRunner};
