//! Build execution engine

pub mod engine;
pub mod executor;
pub mod locks;
pub mod scheduler;

pub use engine::{EngineError, EventHandler, ExecutionEngine, ExecutionEvent};
pub use executor::{ExecutionResult, StepExecutor, StepReport, TriggerRequest};
pub use locks::{LockGuard, LockManager, LockTimeout};
pub use scheduler::{SkipReason, StepDecision, StepScheduler};
