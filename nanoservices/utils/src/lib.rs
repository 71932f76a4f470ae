pub mod error;
pub mod records;

use error::Error;

pub use records::RecordSet;

pub type EltResult<T> = Result<T, Error>;
