//! eltflow_core: task-graph orchestration for extract/load/transform pipelines.
//!
//! Pipelines are declared as a [`dag::DependencyGraph`] of task nodes, sensors
//! and groups, validated into a [`dag::Plan`], and run by the
//! [`scheduler::Executor`]. The [`engine::EltFlow`] engine schedules registered
//! pipelines on their triggers and keeps run history in SQLite.
//!
//! ```no_run
//! use eltflow_core::config;
//! use eltflow_core::engine::EltFlow;
//! use eltflow_core::pipeline::{ecommerce, Collaborators};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = config::from_env()?;
//! let collaborators = Collaborators::from_config(&config)?;
//! let (trigger, def) = ecommerce::definition(&config, collaborators)?;
//! let report = EltFlow::new()
//!     .add_pipeline(trigger, def)
//!     .run_once(ecommerce::PIPELINE)
//!     .await?;
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod dag;
pub mod destinations;
pub mod engine;
pub mod events;
pub mod pipeline;
pub mod scheduler;
pub mod sources;
pub mod store;
pub mod transforms;

pub mod logging;

pub mod metrics;
