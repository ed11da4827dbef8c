//! Persistent Store Adapters
//!
//! Provides the in-memory implementation of the topology store port.

pub mod memory;

pub use memory::*;
