pub use eltflow_core as core;
pub use eltflow_utils as utils;

// Convenience re-exports for common usage
pub use eltflow_core::builder::PipelineBuilder;
pub use eltflow_core::dag::{task_fn, DependencyGraph, Endpoint, NodeOutput, TaskGroup, TaskInputs, TaskNode};
pub use eltflow_core::destinations::traits::LoadSink;
pub use eltflow_core::engine::EltFlow;
pub use eltflow_core::events::trigger::Trigger;
pub use eltflow_core::scheduler::{Executor, ExecutorConfig, RetryPolicy, RunReport, Sensor};
pub use eltflow_core::sources::traits::{ObjectStore, RelationalSource, Source};
pub use eltflow_core::transforms::traits::TransformRunner;
pub use eltflow_utils::{EltResult, RecordSet};
