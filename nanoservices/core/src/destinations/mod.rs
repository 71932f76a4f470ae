pub mod file;
pub mod traits;
pub mod warehouse;

pub use file::FileSink;
pub use traits::{LoadOptions, LoadSink, SchemaInference, TableHandle, WriteMode};
pub use warehouse::WarehouseSink;
