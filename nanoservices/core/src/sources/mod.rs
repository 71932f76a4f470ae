pub mod http_client;
pub mod object_store;
pub mod sql;
pub mod traits;

pub use http_client::{HttpSource, HttpSourceBuilder};
pub use object_store::{FsObjectStore, GcsObjectStore, ObjectExistsSensor, ObjectSource};
pub use sql::SqlSource;
pub use traits::{ObjectStore, RelationalSource, Source};
