//! jobgraph - A CI master that runs builder pipelines as a trigger graph

pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod worker;

// Re-export commonly used types
pub use core::config::MasterConfig;
pub use core::{BuildRecord, BuildResult, Builder, JobGraph, Master, PropertyBag, PropertyValue, Step};
pub use execution::{EngineError, ExecutionEngine, ExecutionEvent};
pub use worker::{LocalWorker, WorkerError, WorkerExecutor, WorkerPool};
