use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::audio::{AudioDevice, DeviceId};
use crate::error::CoordinatorError;
use crate::system::traits::{
    AudioHardware, FileSystemInterface, PermissionGate, PermissionStatus, VirtualDeviceProvider,
};

/// Production implementation of FileSystemInterface using std::fs
pub struct StandardFileSystem;

impl FileSystemInterface for StandardFileSystem {
    fn read_config_file(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))
    }

    fn write_config_file(&self, path: &Path, content: &str) -> Result<()> {
        std::fs::write(path, content)
            .map_err(|e| anyhow::anyhow!("Failed to write config file: {}", e))
    }

    fn config_file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_config_dir(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create config directory: {}", e))
    }
}

impl Default for StandardFileSystem {
    fn default() -> Self {
        Self
    }
}

/// A virtual device installed as an ordinary device in the system device list.
///
/// The device is located by UID once. Its controls are managed by its
/// driver, so enabling them is only recorded here.
pub struct HardwareVirtualDevice {
    hardware: Arc<dyn AudioHardware>,
    id: DeviceId,
    uid: String,
}

impl HardwareVirtualDevice {
    /// Find the device with `uid` in the current device list.
    pub fn find(hardware: Arc<dyn AudioHardware>, uid: &str) -> Result<Self, CoordinatorError> {
        let ids = hardware.device_ids().map_err(|status| {
            CoordinatorError::VirtualDevice(format!("Failed to enumerate devices: {}", status))
        })?;

        let id = ids
            .into_iter()
            .find(|id| hardware.device_uid(*id).is_ok_and(|found| found == uid))
            .ok_or_else(|| {
                CoordinatorError::VirtualDevice(format!("Virtual device '{}' is not installed", uid))
            })?;

        info!("Found virtual device '{}' as {}", uid, id);
        Ok(Self {
            hardware,
            id,
            uid: uid.to_string(),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }
}

impl VirtualDeviceProvider for HardwareVirtualDevice {
    fn device(&self) -> AudioDevice {
        AudioDevice::new(self.id, Arc::clone(&self.hardware))
    }

    fn set_as_default_output(&self) -> Result<(), String> {
        self.hardware
            .set_default_output_device(self.id)
            .map_err(|status| format!("Failed to make {} the default output: {}", self.uid, status))
    }

    fn unset_as_default_output(&self, device: DeviceId) -> Result<(), String> {
        match self.hardware.default_output_device() {
            Ok(Some(current)) if current != self.id => {
                debug!("Default output already moved to {}, leaving it", current);
                return Ok(());
            }
            Ok(_) => {}
            Err(status) => warn!("Failed to read the default output device: {}", status),
        }

        self.hardware
            .set_default_output_device(device)
            .map_err(|status| format!("Failed to make {} the default output: {}", device, status))
    }

    fn set_output_controls_enabled(&self, volume: bool, mute: bool) -> Result<(), String> {
        debug!(
            "Virtual device {} controls: volume {}, mute {}",
            self.uid, volume, mute
        );
        Ok(())
    }
}

/// Permission gate for platforms where output routing needs no prompt
pub struct StaticPermissionGate {
    status: PermissionStatus,
}

impl StaticPermissionGate {
    pub fn new(status: PermissionStatus) -> Self {
        Self { status }
    }
}

impl Default for StaticPermissionGate {
    fn default() -> Self {
        Self::new(PermissionStatus::Granted)
    }
}

impl PermissionGate for StaticPermissionGate {
    fn request_access(&self) -> oneshot::Receiver<PermissionStatus> {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(self.status);
        receiver
    }
}
