pub mod db;

pub use db::{PipelineRunRow, Store, TaskRunRow};
