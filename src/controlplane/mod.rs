//! Control Plane Module
//!
//! Entry points that turn compute-topology changes into sagas, the planning
//! helpers that lay out their steps, and the dispatcher that drives devices.

pub mod api;
pub mod devices;
pub mod dispatch;
pub mod orchestrator;
pub mod steps;

pub use api::{ApiServer, ApiServerConfig, RestRouter};
pub use devices::{DeviceSet, FailureInjector, InMemoryDevices};
pub use dispatch::{DeviceDispatcher, DispatchConfig};
pub use orchestrator::{Orchestrator, OrchestratorConfig, TaskReport};
