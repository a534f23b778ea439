use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::audio::{AudioDevice, DeviceId, PropertyAddress, Scope};
use crate::error::HardwareStatus;
use crate::priority::PreferenceRecord;

/// Invoked by the platform, on an arbitrary thread, when a watched property changes.
pub type PropertyCallback = Arc<dyn Fn() + Send + Sync>;

/// Identifies one registered platform listener so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Trait for audio hardware operations - abstracts CoreAudio for testability
///
/// Every call goes to the live platform state. Nothing is cached.
pub trait AudioHardware: Send + Sync {
    /// IDs of all devices in the system device list, in enumeration order
    fn device_ids(&self) -> Result<Vec<DeviceId>, HardwareStatus>;

    /// The current system default output device
    fn default_output_device(&self) -> Result<Option<DeviceId>, HardwareStatus>;

    /// Make a device the system default output device
    fn set_default_output_device(&self, device: DeviceId) -> Result<(), HardwareStatus>;

    fn device_name(&self, device: DeviceId) -> Result<String, HardwareStatus>;

    /// Persistent UID of the device, stable across reconnects
    fn device_uid(&self, device: DeviceId) -> Result<String, HardwareStatus>;

    /// Number of channels the device has in the given scope
    fn channel_count(&self, device: DeviceId, scope: Scope) -> Result<u32, HardwareStatus>;

    fn has_property(&self, device: DeviceId, address: PropertyAddress) -> bool;

    fn is_property_settable(
        &self,
        device: DeviceId,
        address: PropertyAddress,
    ) -> Result<bool, HardwareStatus>;

    fn get_scalar(
        &self,
        device: DeviceId,
        address: PropertyAddress,
    ) -> Result<f32, HardwareStatus>;

    fn set_scalar(
        &self,
        device: DeviceId,
        address: PropertyAddress,
        value: f32,
    ) -> Result<(), HardwareStatus>;

    fn get_u32(&self, device: DeviceId, address: PropertyAddress) -> Result<u32, HardwareStatus>;

    fn set_u32(
        &self,
        device: DeviceId,
        address: PropertyAddress,
        value: u32,
    ) -> Result<(), HardwareStatus>;

    /// Human readable name of one of the device's data sources
    fn data_source_name(
        &self,
        device: DeviceId,
        scope: Scope,
        source: u32,
    ) -> Result<String, HardwareStatus>;

    /// Register a callback for changes of one property of one object
    fn add_property_listener(
        &self,
        object: DeviceId,
        address: PropertyAddress,
        callback: PropertyCallback,
    ) -> Result<ListenerId, HardwareStatus>;

    /// Remove a callback registered with `add_property_listener`
    fn remove_property_listener(
        &self,
        object: DeviceId,
        address: PropertyAddress,
        listener: ListenerId,
    ) -> Result<(), HardwareStatus>;

    /// Release what is kept for a listener whose object has left the device
    /// list. The platform dropped the registration with the object.
    fn forget_property_listener(&self, listener: ListenerId);
}

/// Trait for the virtual device - the endpoint all system audio is routed through
pub trait VirtualDeviceProvider: Send + Sync {
    /// Handle for the virtual device. Its identity is fixed for the process lifetime.
    fn device(&self) -> AudioDevice;

    /// Make the virtual device the system default output device
    fn set_as_default_output(&self) -> Result<(), String>;

    /// Give the default output role back to `device`
    fn unset_as_default_output(&self, device: DeviceId) -> Result<(), String>;

    /// Enable the virtual device's output volume/mute controls to match the real device
    fn set_output_controls_enabled(&self, volume: bool, mute: bool) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Trait for the platform media-access prompt
pub trait PermissionGate: Send + Sync {
    /// Ask for access. The receiver resolves once the user (or policy) decides.
    fn request_access(&self) -> oneshot::Receiver<PermissionStatus>;
}

/// Trait for the external key-value store holding the preference record
pub trait PreferenceStore: Send + Sync {
    fn load(&self) -> Result<PreferenceRecord>;

    fn save(&self, record: &PreferenceRecord) -> Result<()>;
}

/// Trait for file system operations - abstracts std::fs for testability
pub trait FileSystemInterface: Send + Sync {
    /// Read the entire contents of a configuration file
    fn read_config_file(&self, path: &Path) -> Result<String>;

    /// Write configuration content to a file
    fn write_config_file(&self, path: &Path, content: &str) -> Result<()>;

    /// Check if a configuration file exists
    fn config_file_exists(&self, path: &Path) -> bool;

    /// Create the directory structure for config files
    fn create_config_dir(&self, path: &Path) -> Result<()>;
}
