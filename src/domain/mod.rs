//! Domain layer - Topology records and port definitions
//!
//! This module defines the persisted records the orchestrator reconciles and
//! the core traits (ports) that adapters implement, following hexagonal
//! architecture principles.

pub mod model;
pub mod ports;

pub use model::*;
pub use ports::*;
