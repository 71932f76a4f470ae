pub mod report;
pub mod retry;
pub mod runner;
pub mod sensor;
pub mod state;

pub use report::{NodeReport, RunReport};
pub use retry::{Backoff, RetryPolicy};
pub use runner::{Executor, ExecutorConfig};
pub use sensor::{Sensor, SensorConfig, SensorState};
pub use state::NodeState;
