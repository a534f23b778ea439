use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::audio::{AudioDevice, DeviceId, Property, PropertyAddress, Scope};
use crate::error::HardwareStatus;
use crate::priority::PreferenceRecord;
use crate::system::traits::{
    AudioHardware, FileSystemInterface, ListenerId, PermissionGate, PermissionStatus,
    PreferenceStore, PropertyCallback, VirtualDeviceProvider,
};

/// A simulated device for [`MockAudioHardware`]
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub id: DeviceId,
    pub uid: String,
    pub name: String,
    pub output_channels: u32,
    pub input_channels: u32,
    pub volume: Option<f32>,
    pub mute: Option<bool>,
    pub data_source: Option<u32>,
    pub data_sources: Vec<(u32, String)>,
}

impl MockDevice {
    /// A stereo output device without volume, mute or data source controls
    pub fn output(id: u32, uid: &str, name: &str) -> Self {
        Self {
            id: DeviceId(id),
            uid: uid.to_string(),
            name: name.to_string(),
            output_channels: 2,
            input_channels: 0,
            volume: None,
            mute: None,
            data_source: None,
            data_sources: Vec::new(),
        }
    }

    /// A mono input-only device
    pub fn input(id: u32, uid: &str, name: &str) -> Self {
        Self {
            output_channels: 0,
            input_channels: 1,
            ..Self::output(id, uid, name)
        }
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = Some(volume);
        self
    }

    pub fn with_mute(mut self, muted: bool) -> Self {
        self.mute = Some(muted);
        self
    }

    pub fn with_data_sources(mut self, current: u32, sources: &[(u32, &str)]) -> Self {
        self.data_source = Some(current);
        self.data_sources = sources
            .iter()
            .map(|(id, name)| (*id, name.to_string()))
            .collect();
        self
    }

    fn supports(&self, address: PropertyAddress) -> bool {
        let output_master = address.scope == Scope::Output && address.channel.element() == 0;
        match address.property {
            Property::Volume => output_master && self.volume.is_some(),
            Property::Mute => output_master && self.mute.is_some(),
            Property::DataSource => address.scope == Scope::Output && self.data_source.is_some(),
            Property::Devices | Property::DefaultOutputDevice => false,
        }
    }
}

struct MockListener {
    object: DeviceId,
    address: PropertyAddress,
    callback: PropertyCallback,
}

#[derive(Default)]
struct MockHardwareState {
    devices: Vec<MockDevice>,
    default_output: Option<DeviceId>,
    default_output_history: Vec<DeviceId>,
    listeners: BTreeMap<u64, MockListener>,
    // Listener IDs handed out and not yet removed or forgotten. Outlives the
    // platform registration when a device is unplugged.
    retained: BTreeSet<u64>,
    next_listener: u64,
    property_failure: Option<HardwareStatus>,
    set_default_failure: Option<HardwareStatus>,
    calls: usize,
    writes: usize,
    remove_listener_calls: usize,
}

impl MockHardwareState {
    fn device(&self, id: DeviceId) -> Result<&MockDevice, HardwareStatus> {
        self.devices
            .iter()
            .find(|d| d.id == id)
            .ok_or(HardwareStatus::BAD_OBJECT)
    }

    fn device_mut(&mut self, id: DeviceId) -> Result<&mut MockDevice, HardwareStatus> {
        self.devices
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(HardwareStatus::BAD_OBJECT)
    }

    fn callbacks_for(&self, object: DeviceId, address: PropertyAddress) -> Vec<PropertyCallback> {
        self.listeners
            .values()
            .filter(|l| l.object == object && l.address == address)
            .map(|l| Arc::clone(&l.callback))
            .collect()
    }
}

/// Mock audio hardware for testing - a controllable, in-memory device list
///
/// Listener callbacks are invoked synchronously on the thread that caused the
/// change, after the internal lock is released.
pub struct MockAudioHardware {
    state: Mutex<MockHardwareState>,
}

impl MockAudioHardware {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockHardwareState::default()),
        }
    }

    /// Plug a device in and notify device list listeners
    pub fn add_device(&self, device: MockDevice) {
        self.state.lock().unwrap().devices.push(device);
        self.fire_property_change(DeviceId::SYSTEM, PropertyAddress::device_list());
    }

    /// Unplug a device and notify device list listeners
    ///
    /// Like the real platform, listeners registered on the device are dropped
    /// with it, and a removed default output falls back to the first
    /// remaining output device.
    pub fn remove_device(&self, id: DeviceId) {
        let default_changed = {
            let mut state = self.state.lock().unwrap();
            state.devices.retain(|d| d.id != id);
            state.listeners.retain(|_, l| l.object != id);
            if state.default_output == Some(id) {
                state.default_output = state
                    .devices
                    .iter()
                    .find(|d| d.output_channels > 0)
                    .map(|d| d.id);
                true
            } else {
                false
            }
        };

        self.fire_property_change(DeviceId::SYSTEM, PropertyAddress::device_list());
        if default_changed {
            self.fire_property_change(DeviceId::SYSTEM, PropertyAddress::default_output_device());
        }
    }

    /// Set the default output device without going through the trait
    pub fn set_mock_default_output(&self, id: Option<DeviceId>) {
        self.state.lock().unwrap().default_output = id;
    }

    /// Simulate a hardware volume key on the device
    pub fn change_volume(&self, id: DeviceId, volume: f32) {
        if let Ok(device) = self.state.lock().unwrap().device_mut(id) {
            device.volume = Some(volume);
        }
        self.fire_property_change(id, PropertyAddress::output_volume());
    }

    /// Simulate a hardware mute toggle on the device
    pub fn change_mute(&self, id: DeviceId, muted: bool) {
        if let Ok(device) = self.state.lock().unwrap().device_mut(id) {
            device.mute = Some(muted);
        }
        self.fire_property_change(id, PropertyAddress::output_mute());
    }

    /// Invoke every listener registered for the property
    pub fn fire_property_change(&self, object: DeviceId, address: PropertyAddress) {
        let callbacks = self.state.lock().unwrap().callbacks_for(object, address);
        for callback in callbacks {
            callback();
        }
    }

    pub fn listener_count(&self, object: DeviceId, address: PropertyAddress) -> usize {
        self.state
            .lock()
            .unwrap()
            .callbacks_for(object, address)
            .len()
    }

    pub fn total_listener_count(&self) -> usize {
        self.state.lock().unwrap().listeners.len()
    }

    /// Listener IDs the caller has not yet removed or forgotten
    pub fn retained_listener_count(&self) -> usize {
        self.state.lock().unwrap().retained.len()
    }

    /// Make every property read/write fail with `status` (None to stop failing)
    pub fn fail_property_access(&self, status: Option<HardwareStatus>) {
        self.state.lock().unwrap().property_failure = status;
    }

    /// Make setting the default output device fail with `status`
    pub fn fail_set_default(&self, status: Option<HardwareStatus>) {
        self.state.lock().unwrap().set_default_failure = status;
    }

    pub fn device_volume(&self, id: DeviceId) -> Option<f32> {
        self.state
            .lock()
            .unwrap()
            .device(id)
            .ok()
            .and_then(|d| d.volume)
    }

    pub fn device_mute(&self, id: DeviceId) -> Option<bool> {
        self.state
            .lock()
            .unwrap()
            .device(id)
            .ok()
            .and_then(|d| d.mute)
    }

    pub fn mock_default_output(&self) -> Option<DeviceId> {
        self.state.lock().unwrap().default_output
    }

    /// Every device made default through the trait, in order
    pub fn default_output_history(&self) -> Vec<DeviceId> {
        self.state.lock().unwrap().default_output_history.clone()
    }

    /// Number of trait calls made so far
    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    /// Number of successful property writes
    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn remove_listener_calls(&self) -> usize {
        self.state.lock().unwrap().remove_listener_calls
    }

    fn read<T>(
        &self,
        device: DeviceId,
        address: PropertyAddress,
        read: impl FnOnce(&MockDevice) -> Option<T>,
    ) -> Result<T, HardwareStatus> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if let Some(status) = state.property_failure {
            return Err(status);
        }
        let device = state.device(device)?;
        if !device.supports(address) {
            return Err(HardwareStatus::UNKNOWN_PROPERTY);
        }
        read(device).ok_or(HardwareStatus::UNKNOWN_PROPERTY)
    }

    /// Apply `write`; listeners fire only if it reports a change.
    fn write(
        &self,
        device: DeviceId,
        address: PropertyAddress,
        write: impl FnOnce(&mut MockDevice) -> bool,
    ) -> Result<(), HardwareStatus> {
        let changed = {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            if let Some(status) = state.property_failure {
                return Err(status);
            }
            let mock = state.device_mut(device)?;
            if !mock.supports(address) {
                return Err(HardwareStatus::UNKNOWN_PROPERTY);
            }
            let changed = write(mock);
            state.writes += 1;
            changed
        };

        if changed {
            self.fire_property_change(device, address);
        }
        Ok(())
    }
}

impl Default for MockAudioHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHardware for MockAudioHardware {
    fn device_ids(&self) -> Result<Vec<DeviceId>, HardwareStatus> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        Ok(state.devices.iter().map(|d| d.id).collect())
    }

    fn default_output_device(&self) -> Result<Option<DeviceId>, HardwareStatus> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        Ok(state.default_output)
    }

    fn set_default_output_device(&self, device: DeviceId) -> Result<(), HardwareStatus> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            if let Some(status) = state.set_default_failure {
                return Err(status);
            }
            state.device(device)?;
            state.default_output = Some(device);
            state.default_output_history.push(device);
        }

        self.fire_property_change(DeviceId::SYSTEM, PropertyAddress::default_output_device());
        Ok(())
    }

    fn device_name(&self, device: DeviceId) -> Result<String, HardwareStatus> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.device(device).map(|d| d.name.clone())
    }

    fn device_uid(&self, device: DeviceId) -> Result<String, HardwareStatus> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.device(device).map(|d| d.uid.clone())
    }

    fn channel_count(&self, device: DeviceId, scope: Scope) -> Result<u32, HardwareStatus> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        let device = state.device(device)?;
        Ok(match scope {
            Scope::Output => device.output_channels,
            Scope::Input => device.input_channels,
            Scope::Global => device.output_channels + device.input_channels,
        })
    }

    fn has_property(&self, device: DeviceId, address: PropertyAddress) -> bool {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if device == DeviceId::SYSTEM {
            return matches!(
                address.property,
                Property::Devices | Property::DefaultOutputDevice
            );
        }
        state
            .device(device)
            .map(|d| d.supports(address))
            .unwrap_or(false)
    }

    fn is_property_settable(
        &self,
        device: DeviceId,
        address: PropertyAddress,
    ) -> Result<bool, HardwareStatus> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.device(device).map(|d| d.supports(address))
    }

    fn get_scalar(
        &self,
        device: DeviceId,
        address: PropertyAddress,
    ) -> Result<f32, HardwareStatus> {
        self.read(device, address, |d| d.volume)
    }

    fn set_scalar(
        &self,
        device: DeviceId,
        address: PropertyAddress,
        value: f32,
    ) -> Result<(), HardwareStatus> {
        self.write(device, address, |d| {
            let changed = d.volume != Some(value);
            d.volume = Some(value);
            changed
        })
    }

    fn get_u32(&self, device: DeviceId, address: PropertyAddress) -> Result<u32, HardwareStatus> {
        self.read(device, address, |d| match address.property {
            Property::Mute => d.mute.map(u32::from),
            Property::DataSource => d.data_source,
            _ => None,
        })
    }

    fn set_u32(
        &self,
        device: DeviceId,
        address: PropertyAddress,
        value: u32,
    ) -> Result<(), HardwareStatus> {
        self.write(device, address, |d| match address.property {
            Property::Mute => {
                let muted = value != 0;
                let changed = d.mute != Some(muted);
                d.mute = Some(muted);
                changed
            }
            Property::DataSource => {
                let changed = d.data_source != Some(value);
                d.data_source = Some(value);
                changed
            }
            _ => false,
        })
    }

    fn data_source_name(
        &self,
        device: DeviceId,
        _scope: Scope,
        source: u32,
    ) -> Result<String, HardwareStatus> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if let Some(status) = state.property_failure {
            return Err(status);
        }
        state
            .device(device)?
            .data_sources
            .iter()
            .find(|(id, _)| *id == source)
            .map(|(_, name)| name.clone())
            .ok_or(HardwareStatus::UNKNOWN_PROPERTY)
    }

    fn add_property_listener(
        &self,
        object: DeviceId,
        address: PropertyAddress,
        callback: PropertyCallback,
    ) -> Result<ListenerId, HardwareStatus> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if object != DeviceId::SYSTEM {
            state.device(object)?;
        }
        state.next_listener += 1;
        let id = state.next_listener;
        state.retained.insert(id);
        state.listeners.insert(
            id,
            MockListener {
                object,
                address,
                callback,
            },
        );
        Ok(ListenerId(id))
    }

    fn remove_property_listener(
        &self,
        object: DeviceId,
        _address: PropertyAddress,
        listener: ListenerId,
    ) -> Result<(), HardwareStatus> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.remove_listener_calls += 1;
        if object != DeviceId::SYSTEM {
            state.device(object)?;
        }
        state.retained.remove(&listener.0);
        state
            .listeners
            .remove(&listener.0)
            .map(|_| ())
            .ok_or(HardwareStatus::ILLEGAL_OPERATION)
    }

    fn forget_property_listener(&self, listener: ListenerId) {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.retained.remove(&listener.0);
    }
}

/// Mock virtual device provider - records control and default-device requests
pub struct MockVirtualDevice {
    hardware: Arc<MockAudioHardware>,
    id: DeviceId,
    controls_enabled: Mutex<Option<(bool, bool)>>,
    set_default_failure: Mutex<Option<String>>,
    unset_calls: Mutex<Vec<DeviceId>>,
}

impl MockVirtualDevice {
    pub fn new(hardware: Arc<MockAudioHardware>, id: DeviceId) -> Self {
        Self {
            hardware,
            id,
            controls_enabled: Mutex::new(None),
            set_default_failure: Mutex::new(None),
            unset_calls: Mutex::new(Vec::new()),
        }
    }

    /// Last `(volume, mute)` pair passed to `set_output_controls_enabled`
    pub fn controls_enabled(&self) -> Option<(bool, bool)> {
        *self.controls_enabled.lock().unwrap()
    }

    /// Configure the mock to fail marking itself as default with `message`
    pub fn fail_set_default(&self, message: Option<&str>) {
        *self.set_default_failure.lock().unwrap() = message.map(str::to_string);
    }

    pub fn unset_calls(&self) -> Vec<DeviceId> {
        self.unset_calls.lock().unwrap().clone()
    }
}

impl VirtualDeviceProvider for MockVirtualDevice {
    fn device(&self) -> AudioDevice {
        let hardware: Arc<dyn AudioHardware> = self.hardware.clone();
        AudioDevice::new(self.id, hardware)
    }

    fn set_as_default_output(&self) -> Result<(), String> {
        if let Some(message) = self.set_default_failure.lock().unwrap().clone() {
            return Err(message);
        }
        self.hardware
            .set_default_output_device(self.id)
            .map_err(|status| format!("Could not set the virtual device as default: {}", status))
    }

    fn unset_as_default_output(&self, device: DeviceId) -> Result<(), String> {
        self.unset_calls.lock().unwrap().push(device);
        self.hardware
            .set_default_output_device(device)
            .map_err(|status| format!("Could not restore default device: {}", status))
    }

    fn set_output_controls_enabled(&self, volume: bool, mute: bool) -> Result<(), String> {
        *self.controls_enabled.lock().unwrap() = Some((volume, mute));
        Ok(())
    }
}

/// Mock permission gate that answers immediately
pub struct MockPermissionGate {
    status: PermissionStatus,
    requests: Mutex<usize>,
}

impl MockPermissionGate {
    pub fn granted() -> Self {
        Self {
            status: PermissionStatus::Granted,
            requests: Mutex::new(0),
        }
    }

    pub fn denied() -> Self {
        Self {
            status: PermissionStatus::Denied,
            requests: Mutex::new(0),
        }
    }

    pub fn request_count(&self) -> usize {
        *self.requests.lock().unwrap()
    }
}

impl PermissionGate for MockPermissionGate {
    fn request_access(&self) -> oneshot::Receiver<PermissionStatus> {
        *self.requests.lock().unwrap() += 1;
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(self.status);
        receiver
    }
}

/// Mock preference store - keeps the record in memory and counts saves
pub struct MockPreferenceStore {
    record: Mutex<PreferenceRecord>,
    saves: Mutex<usize>,
    should_fail: Mutex<bool>,
}

impl MockPreferenceStore {
    pub fn new(record: PreferenceRecord) -> Self {
        Self {
            record: Mutex::new(record),
            saves: Mutex::new(0),
            should_fail: Mutex::new(false),
        }
    }

    /// Configure the mock to fail both loads and saves
    pub fn set_failure(&self, should_fail: bool) {
        *self.should_fail.lock().unwrap() = should_fail;
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }

    pub fn stored(&self) -> PreferenceRecord {
        self.record.lock().unwrap().clone()
    }
}

impl PreferenceStore for MockPreferenceStore {
    fn load(&self) -> Result<PreferenceRecord> {
        if *self.should_fail.lock().unwrap() {
            return Err(anyhow::anyhow!("Mock preference load failure"));
        }
        Ok(self.record.lock().unwrap().clone())
    }

    fn save(&self, record: &PreferenceRecord) -> Result<()> {
        if *self.should_fail.lock().unwrap() {
            return Err(anyhow::anyhow!("Mock preference save failure"));
        }
        *self.saves.lock().unwrap() += 1;
        *self.record.lock().unwrap() = record.clone();
        Ok(())
    }
}

/// Mock file system for testing - provides controllable file operations
#[derive(Clone, Default)]
pub struct MockFileSystem {
    pub files: Arc<Mutex<HashMap<PathBuf, String>>>,
    pub write_calls: Arc<Mutex<Vec<(PathBuf, String)>>>,
    pub directory_creation_calls: Arc<Mutex<Vec<PathBuf>>>,
    pub should_fail_read: Arc<Mutex<bool>>,
    pub should_fail_write: Arc<Mutex<bool>>,
    pub should_fail_create_dir: Arc<Mutex<bool>>,
}

impl MockFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file to the mock file system
    pub fn add_file<P: AsRef<Path>>(&self, path: P, content: String) {
        self.files
            .lock()
            .unwrap()
            .insert(path.as_ref().to_path_buf(), content);
    }

    /// Read back a file from the mock file system
    pub fn file_content<P: AsRef<Path>>(&self, path: P) -> Option<String> {
        self.files.lock().unwrap().get(path.as_ref()).cloned()
    }

    /// Get all write calls that were made
    pub fn get_write_calls(&self) -> Vec<(PathBuf, String)> {
        self.write_calls.lock().unwrap().clone()
    }

    /// Get all directory creation calls that were made
    pub fn get_directory_creation_calls(&self) -> Vec<PathBuf> {
        self.directory_creation_calls.lock().unwrap().clone()
    }

    /// Configure the mock to fail read operations
    pub fn set_read_failure(&self, should_fail: bool) {
        *self.should_fail_read.lock().unwrap() = should_fail;
    }

    /// Configure the mock to fail write operations
    pub fn set_write_failure(&self, should_fail: bool) {
        *self.should_fail_write.lock().unwrap() = should_fail;
    }

    /// Configure the mock to fail directory creation
    pub fn set_create_dir_failure(&self, should_fail: bool) {
        *self.should_fail_create_dir.lock().unwrap() = should_fail;
    }
}

impl FileSystemInterface for MockFileSystem {
    fn read_config_file(&self, path: &Path) -> Result<String> {
        if *self.should_fail_read.lock().unwrap() {
            return Err(anyhow::anyhow!("Mock read failure"));
        }

        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("File not found: {}", path.display()))
    }

    fn write_config_file(&self, path: &Path, content: &str) -> Result<()> {
        self.write_calls
            .lock()
            .unwrap()
            .push((path.to_path_buf(), content.to_string()));

        if *self.should_fail_write.lock().unwrap() {
            return Err(anyhow::anyhow!("Mock write failure"));
        }

        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), content.to_string());
        Ok(())
    }

    fn config_file_exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn create_config_dir(&self, path: &Path) -> Result<()> {
        self.directory_creation_calls
            .lock()
            .unwrap()
            .push(path.to_path_buf());

        if *self.should_fail_create_dir.lock().unwrap() {
            return Err(anyhow::anyhow!("Mock create directory failure"));
        }

        Ok(())
    }
}
