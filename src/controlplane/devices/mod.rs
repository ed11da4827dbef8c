//! In-Memory Device Controllers
//!
//! Simulated adapters for the external systems the orchestrator drives:
//! - Block: export-group updates and deletes against the topology store
//! - File: asynchronous share export tasks
//! - Host: ESX datastores, storage I/O control and SAN boot targets
//! - Mount: directories, fstab entries and mounts per host
//!
//! Every adapter carries a [`FailureInjector`] so any step of a saga can be
//! made to fail on demand.

pub mod block;
pub mod file;
pub mod host;
pub mod mount;

pub use block::*;
pub use file::*;
pub use host::*;
pub use mount::*;

use crate::domain::ports::{
    BlockExportControllerRef, FileExportControllerRef, HostAdapterRef, MountAdapterRef,
    TopologyStoreRef,
};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

// =============================================================================
// Failure Injection
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum FailureRule {
    Always,
    Times(u32),
}

/// Per-operation failure switches for a simulated device
#[derive(Debug, Default)]
pub struct FailureInjector {
    rules: Mutex<HashMap<String, FailureRule>>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call of `operation` until cleared
    pub fn fail(&self, operation: &str) {
        self.rules
            .lock()
            .insert(operation.to_string(), FailureRule::Always);
    }

    /// Fail the next `times` calls of `operation`
    pub fn fail_times(&self, operation: &str, times: u32) {
        self.rules
            .lock()
            .insert(operation.to_string(), FailureRule::Times(times));
    }

    pub fn clear(&self, operation: &str) {
        self.rules.lock().remove(operation);
    }

    pub fn clear_all(&self) {
        self.rules.lock().clear();
    }

    /// Consume one failure for `operation`, if armed
    pub fn check(&self, device: &str, operation: &str) -> Result<()> {
        let mut rules = self.rules.lock();
        let fire = match rules.get_mut(operation) {
            Some(FailureRule::Always) => true,
            Some(FailureRule::Times(n)) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        };
        if fire {
            debug!("Injected failure: {} {}", device, operation);
            return Err(Error::DeviceOperationFailed {
                device: device.to_string(),
                operation: operation.to_string(),
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Device Set
// =============================================================================

/// The device ports one orchestrator drives
#[derive(Clone)]
pub struct DeviceSet {
    pub block: BlockExportControllerRef,
    pub file: FileExportControllerRef,
    pub host: HostAdapterRef,
    pub mount: MountAdapterRef,
}

/// Concrete in-memory devices, kept typed so tests can inject failures and
/// inspect device state
#[derive(Clone)]
pub struct InMemoryDevices {
    pub block: Arc<InMemoryBlockController>,
    pub file: Arc<InMemoryFileController>,
    pub host: Arc<InMemoryHostAdapter>,
    pub mount: Arc<InMemoryMountAdapter>,
}

impl InMemoryDevices {
    pub fn new(store: TopologyStoreRef) -> Self {
        Self {
            block: Arc::new(InMemoryBlockController::new(
                BlockControllerConfig::default(),
                store.clone(),
            )),
            file: Arc::new(InMemoryFileController::new(
                FileControllerConfig::default(),
                store,
            )),
            host: Arc::new(InMemoryHostAdapter::new()),
            mount: Arc::new(InMemoryMountAdapter::new()),
        }
    }

    pub fn device_set(&self) -> DeviceSet {
        DeviceSet {
            block: self.block.clone(),
            file: self.file.clone(),
            host: self.host.clone(),
            mount: self.mount.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_fail_times_is_consumed() {
        let failures = FailureInjector::new();
        failures.fail_times("mount_device", 2);

        assert_matches!(
            failures.check("mount", "mount_device"),
            Err(Error::DeviceOperationFailed { .. })
        );
        assert!(failures.check("mount", "mount_device").is_err());
        assert!(failures.check("mount", "mount_device").is_ok());
        assert!(failures.check("mount", "unmount_device").is_ok());
    }

    #[test]
    fn test_fail_until_cleared() {
        let failures = FailureInjector::new();
        failures.fail("export_group_delete");
        for _ in 0..3 {
            assert!(failures.check("block", "export_group_delete").is_err());
        }
        failures.clear("export_group_delete");
        assert!(failures.check("block", "export_group_delete").is_ok());
    }
}
