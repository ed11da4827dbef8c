//! Workflow Layer
//!
//! Step graphs, the saga execution engine and the primitives it relies on:
//! named locks, bounded waits on downstream tasks and lifecycle events.

pub mod engine;
pub mod events;
pub mod graph;
pub mod invocation;
pub mod locks;
pub mod step;
pub mod wait;

pub use engine::{
    EngineConfig, InvocationHandler, InvocationHandlerRef, SagaEngine, SagaOutcome, SagaReport,
    StepContext, StepDataStore, Workflow,
};
pub use events::{WorkflowEvent, WorkflowOutcome};
pub use graph::{StepGraph, StepNode, StepSpec, StepToken, WaitFor};
pub use invocation::Invocation;
pub use locks::{mount_lock_key, LockManager, StepLocks};
pub use step::{StepRecord, StepState};
pub use wait::{into_result, wait_for_terminal};
