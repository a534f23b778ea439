use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{DeviceError, HardwareStatus};
use crate::system::AudioHardware;

/// Shown when neither a data source name nor a device name can be read.
pub const GENERIC_DEVICE_NAME: &str = "Unknown Device";

/// Opaque platform identifier of an audio object.
///
/// Stable while the device stays connected, not across reconnects. Use the
/// device UID for anything that is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl DeviceId {
    /// `kAudioObjectUnknown`
    pub const UNKNOWN: Self = Self(0);
    /// `kAudioObjectSystemObject`, the owner of the device list.
    pub const SYSTEM: Self = Self(1);
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Global,
    Input,
    Output,
}

/// Master control or one numbered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Master,
    Index(u32),
}

impl Channel {
    pub fn element(self) -> u32 {
        match self {
            Channel::Master => 0,
            Channel::Index(index) => index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Property {
    /// The system device list. Only meaningful on [`DeviceId::SYSTEM`].
    Devices,
    /// The system default output device. Only meaningful on [`DeviceId::SYSTEM`].
    DefaultOutputDevice,
    Volume,
    Mute,
    DataSource,
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Property::Devices => "devices",
            Property::DefaultOutputDevice => "default output device",
            Property::Volume => "volume",
            Property::Mute => "mute",
            Property::DataSource => "data source",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyAddress {
    pub property: Property,
    pub scope: Scope,
    pub channel: Channel,
}

impl PropertyAddress {
    pub const fn new(property: Property, scope: Scope, channel: Channel) -> Self {
        Self {
            property,
            scope,
            channel,
        }
    }

    pub const fn device_list() -> Self {
        Self::new(Property::Devices, Scope::Global, Channel::Master)
    }

    pub const fn default_output_device() -> Self {
        Self::new(Property::DefaultOutputDevice, Scope::Global, Channel::Master)
    }

    pub const fn output_volume() -> Self {
        Self::new(Property::Volume, Scope::Output, Channel::Master)
    }

    pub const fn output_mute() -> Self {
        Self::new(Property::Mute, Scope::Output, Channel::Master)
    }

    pub const fn output_data_source() -> Self {
        Self::new(Property::DataSource, Scope::Output, Channel::Master)
    }
}

impl fmt::Display for PropertyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}/{:?})", self.property, self.scope, self.channel)
    }
}

/// Which controls a device offers for one scope and channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub volume: bool,
    pub mute: bool,
    pub data_source: bool,
}

/// Handle to one audio endpoint, real or virtual.
///
/// Constructing a handle never touches the hardware. Every other operation
/// is evaluated against the live device list, so holding a handle does not
/// keep the device around.
#[derive(Clone)]
pub struct AudioDevice {
    id: DeviceId,
    hardware: Arc<dyn AudioHardware>,
}

impl AudioDevice {
    pub fn new(id: DeviceId, hardware: Arc<dyn AudioHardware>) -> Self {
        Self { id, hardware }
    }

    /// Handle for the system object, which owns the device list.
    pub fn system(hardware: Arc<dyn AudioHardware>) -> Self {
        Self::new(DeviceId::SYSTEM, hardware)
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn hardware(&self) -> &Arc<dyn AudioHardware> {
        &self.hardware
    }

    /// True iff the device is currently in the system device list.
    pub fn exists(&self) -> bool {
        if self.id == DeviceId::SYSTEM {
            return true;
        }

        match self.hardware.device_ids() {
            Ok(ids) => ids.contains(&self.id),
            Err(status) => {
                warn!("Failed to read the device list while checking {}: {}", self.id, status);
                false
            }
        }
    }

    pub fn name(&self) -> Result<String, DeviceError> {
        self.ensure_exists()?;
        self.hardware
            .device_name(self.id)
            .map_err(|status| self.hardware_error("name lookup", status))
    }

    pub fn uid(&self) -> Result<String, DeviceError> {
        self.ensure_exists()?;
        self.hardware
            .device_uid(self.id)
            .map_err(|status| self.hardware_error("uid lookup", status))
    }

    /// True if the device has at least one output channel.
    pub fn supports_output(&self) -> Result<bool, DeviceError> {
        self.ensure_exists()?;
        self.hardware
            .channel_count(self.id, Scope::Output)
            .map(|channels| channels > 0)
            .map_err(|status| self.hardware_error("stream configuration", status))
    }

    pub fn capabilities(&self, scope: Scope, channel: Channel) -> Result<Capabilities, DeviceError> {
        Ok(Capabilities {
            volume: self.has_volume(scope, channel)?,
            mute: self.has_mute(scope, channel)?,
            data_source: self.has_data_source(scope)?,
        })
    }

    pub fn has_volume(&self, scope: Scope, channel: Channel) -> Result<bool, DeviceError> {
        self.has_settable(PropertyAddress::new(Property::Volume, scope, channel))
    }

    /// Volume scalar in `[0.0, 1.0]`.
    pub fn volume(&self, scope: Scope, channel: Channel) -> Result<f32, DeviceError> {
        let address = PropertyAddress::new(Property::Volume, scope, channel);
        self.require(address, "volume control")?;
        self.hardware
            .get_scalar(self.id, address)
            .map(|volume| volume.clamp(0.0, 1.0))
            .map_err(|status| self.hardware_error("get volume", status))
    }

    /// Sets the volume scalar. Values outside `[0.0, 1.0]` are clamped.
    pub fn set_volume(&self, scope: Scope, channel: Channel, volume: f32) -> Result<(), DeviceError> {
        let address = PropertyAddress::new(Property::Volume, scope, channel);
        self.require(address, "volume control")?;
        self.hardware
            .set_scalar(self.id, address, volume.clamp(0.0, 1.0))
            .map_err(|status| self.hardware_error("set volume", status))
    }

    pub fn has_mute(&self, scope: Scope, channel: Channel) -> Result<bool, DeviceError> {
        self.has_settable(PropertyAddress::new(Property::Mute, scope, channel))
    }

    pub fn is_muted(&self, scope: Scope, channel: Channel) -> Result<bool, DeviceError> {
        let address = PropertyAddress::new(Property::Mute, scope, channel);
        self.require(address, "mute control")?;
        self.hardware
            .get_u32(self.id, address)
            .map(|muted| muted != 0)
            .map_err(|status| self.hardware_error("get mute", status))
    }

    pub fn set_mute(&self, scope: Scope, channel: Channel, muted: bool) -> Result<(), DeviceError> {
        let address = PropertyAddress::new(Property::Mute, scope, channel);
        self.require(address, "mute control")?;
        self.hardware
            .set_u32(self.id, address, u32::from(muted))
            .map_err(|status| self.hardware_error("set mute", status))
    }

    /// Data sources are readable without being settable, so only presence is checked.
    pub fn has_data_source(&self, scope: Scope) -> Result<bool, DeviceError> {
        self.ensure_exists()?;
        let address = PropertyAddress::new(Property::DataSource, scope, Channel::Master);
        Ok(self.hardware.has_property(self.id, address))
    }

    pub fn data_source(&self, scope: Scope) -> Result<u32, DeviceError> {
        self.ensure_data_source(scope)?;
        let address = PropertyAddress::new(Property::DataSource, scope, Channel::Master);
        self.hardware
            .get_u32(self.id, address)
            .map_err(|status| self.hardware_error("get data source", status))
    }

    pub fn set_data_source(&self, scope: Scope, source: u32) -> Result<(), DeviceError> {
        let address = PropertyAddress::new(Property::DataSource, scope, Channel::Master);
        self.require(address, "data source selection")?;
        self.hardware
            .set_u32(self.id, address, source)
            .map_err(|status| self.hardware_error("set data source", status))
    }

    pub fn data_source_name(&self, scope: Scope, source: u32) -> Result<String, DeviceError> {
        self.ensure_data_source(scope)?;
        self.hardware
            .data_source_name(self.id, scope, source)
            .map_err(|status| self.hardware_error("data source name", status))
    }

    /// Name for menus: the current data source if there is one, else the
    /// device name, else [`GENERIC_DEVICE_NAME`]. Never fails.
    pub fn display_name(&self, scope: Scope) -> String {
        let from_data_source = self
            .data_source(scope)
            .and_then(|source| self.data_source_name(scope, source));

        match from_data_source {
            Ok(name) if !name.is_empty() => return name,
            Ok(_) => {}
            Err(e) => debug!("No data source name for {}: {}", self.id, e),
        }

        match self.name() {
            Ok(name) if !name.is_empty() => name,
            Ok(_) => GENERIC_DEVICE_NAME.to_string(),
            Err(e) => {
                debug!("Falling back to generic name for {}: {}", self.id, e);
                GENERIC_DEVICE_NAME.to_string()
            }
        }
    }

    fn ensure_exists(&self) -> Result<(), DeviceError> {
        if self.exists() {
            Ok(())
        } else {
            Err(DeviceError::DeviceUnavailable { device: self.id })
        }
    }

    fn ensure_data_source(&self, scope: Scope) -> Result<(), DeviceError> {
        if self.has_data_source(scope)? {
            Ok(())
        } else {
            Err(DeviceError::UnsupportedOperation {
                device: self.id,
                operation: "data source",
            })
        }
    }

    fn has_settable(&self, address: PropertyAddress) -> Result<bool, DeviceError> {
        self.ensure_exists()?;
        if !self.hardware.has_property(self.id, address) {
            return Ok(false);
        }
        self.hardware
            .is_property_settable(self.id, address)
            .map_err(|status| self.hardware_error("capability query", status))
    }

    fn require(&self, address: PropertyAddress, operation: &'static str) -> Result<(), DeviceError> {
        if self.has_settable(address)? {
            Ok(())
        } else {
            Err(DeviceError::UnsupportedOperation {
                device: self.id,
                operation,
            })
        }
    }

    // The device can vanish between the existence check and the call. The
    // platform then reports a bad object, which is not a hardware fault.
    fn hardware_error(&self, operation: &'static str, status: HardwareStatus) -> DeviceError {
        if status.is_missing_object() && !self.exists() {
            DeviceError::DeviceUnavailable { device: self.id }
        } else {
            DeviceError::HardwareError {
                device: self.id,
                operation,
                status,
            }
        }
    }
}

impl PartialEq for AudioDevice {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AudioDevice {}

impl Hash for AudioDevice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioDevice").field("id", &self.id).finish()
    }
}

impl fmt::Display for AudioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hardware.device_name(self.id) {
            Ok(name) => write!(f, "{} ({})", name, self.id),
            Err(_) => write!(f, "{}", self.id),
        }
    }
}
