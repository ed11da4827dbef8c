//! API Module
//!
//! REST surface over the orchestrator entry points.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
