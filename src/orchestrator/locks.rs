//! Per-device write locks
//!
//! At most one job holds a device at a time. A second request is rejected,
//! never queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::job::JobId;

#[derive(Debug, Clone, Default)]
pub struct DeviceLocks {
    held: Arc<Mutex<HashMap<String, JobId>>>,
}

/// Releases the device when dropped
#[derive(Debug)]
pub struct DeviceLockGuard {
    device_id: String,
    held: Arc<Mutex<HashMap<String, JobId>>>,
}

impl DeviceLocks {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobId>> {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `device_id` for `job_id`, or return the current holder
    pub fn try_acquire(&self, device_id: &str, job_id: JobId) -> Result<DeviceLockGuard, JobId> {
        let mut held = self.lock();
        if let Some(holder) = held.get(device_id) {
            return Err(*holder);
        }
        held.insert(device_id.to_string(), job_id);
        Ok(DeviceLockGuard {
            device_id: device_id.to_string(),
            held: Arc::clone(&self.held),
        })
    }

    pub fn holder(&self, device_id: &str) -> Option<JobId> {
        self.lock().get(device_id).copied()
    }

    pub fn active(&self) -> usize {
        self.lock().len()
    }
}

impl Drop for DeviceLockGuard {
    fn drop(&mut self) {
        let mut held = self
            .held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.device_id);
    }
}
