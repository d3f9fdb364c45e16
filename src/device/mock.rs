//! In-memory `DeviceBackend` used by tests and by `--mock` for manual
//! testing on non-macOS hosts.

use std::sync::Mutex;

use kbd_proto::{Device, EngineError};

use super::DeviceBackend;

pub struct MockBackend {
    devices: Mutex<Vec<Device>>,
}

impl MockBackend {
    pub fn new(devices: Vec<Device>) -> Self {
        Self { devices: Mutex::new(devices) }
    }

    pub fn set_devices(&self, devices: Vec<Device>) {
        *self.devices.lock().unwrap() = devices;
    }
}

impl DeviceBackend for MockBackend {
    fn enumerate(&self) -> Result<Vec<Device>, EngineError> {
        Ok(self.devices.lock().unwrap().clone())
    }
}
