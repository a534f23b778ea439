use core_foundation::base::TCFType;
use core_foundation::string::{CFString, CFStringRef};
use coreaudio_sys::*;
use std::collections::HashMap;
use std::mem;
use std::os::raw::c_void;
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::audio::{DeviceId, Property, PropertyAddress, Scope};
use crate::error::HardwareStatus;
use crate::system::traits::{AudioHardware, ListenerId, PropertyCallback};

const NO_ERROR: OSStatus = kAudioHardwareNoError as OSStatus;

struct RegisteredListener {
    object: DeviceId,
    address: PropertyAddress,
    // Boxed so the pointer handed to CoreAudio stays put until removal.
    callback: Box<PropertyCallback>,
}

/// Production implementation of AudioHardware using CoreAudio
pub struct CoreAudioHardware {
    listeners: Mutex<HashMap<u64, RegisteredListener>>,
    next_listener: AtomicU64,
}

impl CoreAudioHardware {
    pub fn new() -> Self {
        info!("Initialized CoreAudio hardware backend");
        Self {
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    fn check(status: OSStatus) -> Result<(), HardwareStatus> {
        if status == NO_ERROR {
            Ok(())
        } else {
            Err(HardwareStatus(status))
        }
    }

    fn data_size(
        object: DeviceId,
        address: &AudioObjectPropertyAddress,
    ) -> Result<u32, HardwareStatus> {
        let mut size: u32 = 0;
        let status = unsafe {
            AudioObjectGetPropertyDataSize(object.0, address, 0, ptr::null(), &mut size)
        };
        Self::check(status)?;
        Ok(size)
    }

    fn read_value<T: Copy>(
        object: DeviceId,
        address: &AudioObjectPropertyAddress,
        mut value: T,
    ) -> Result<T, HardwareStatus> {
        let mut size = mem::size_of::<T>() as u32;
        let status = unsafe {
            AudioObjectGetPropertyData(
                object.0,
                address,
                0,
                ptr::null(),
                &mut size,
                &mut value as *mut T as *mut c_void,
            )
        };
        Self::check(status)?;
        Ok(value)
    }

    fn write_value<T: Copy>(
        object: DeviceId,
        address: &AudioObjectPropertyAddress,
        value: T,
    ) -> Result<(), HardwareStatus> {
        let status = unsafe {
            AudioObjectSetPropertyData(
                object.0,
                address,
                0,
                ptr::null(),
                mem::size_of::<T>() as u32,
                &value as *const T as *const c_void,
            )
        };
        Self::check(status)
    }

    fn read_string(
        object: DeviceId,
        address: &AudioObjectPropertyAddress,
    ) -> Result<String, HardwareStatus> {
        let cf_string: CFStringRef = Self::read_value(object, address, ptr::null())?;
        if cf_string.is_null() {
            return Err(HardwareStatus::UNSPECIFIED);
        }
        // Copy-rule properties: we own the returned reference.
        let cf_string = unsafe { CFString::wrap_under_create_rule(cf_string) };
        Ok(cf_string.to_string())
    }
}

impl Default for CoreAudioHardware {
    fn default() -> Self {
        Self::new()
    }
}

fn raw_address(address: PropertyAddress) -> AudioObjectPropertyAddress {
    let selector = match address.property {
        Property::Devices => kAudioHardwarePropertyDevices,
        Property::DefaultOutputDevice => kAudioHardwarePropertyDefaultOutputDevice,
        Property::Volume => kAudioDevicePropertyVolumeScalar,
        Property::Mute => kAudioDevicePropertyMute,
        Property::DataSource => kAudioDevicePropertyDataSource,
    };
    AudioObjectPropertyAddress {
        mSelector: selector,
        mScope: raw_scope(address.scope),
        mElement: address.channel.element(),
    }
}

fn raw_scope(scope: Scope) -> AudioObjectPropertyScope {
    match scope {
        Scope::Global => kAudioObjectPropertyScopeGlobal,
        Scope::Input => kAudioDevicePropertyScopeInput,
        Scope::Output => kAudioDevicePropertyScopeOutput,
    }
}

fn global_address(selector: AudioObjectPropertySelector) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        mSelector: selector,
        mScope: kAudioObjectPropertyScopeGlobal,
        mElement: kAudioObjectPropertyElementMain,
    }
}

impl AudioHardware for CoreAudioHardware {
    fn device_ids(&self) -> Result<Vec<DeviceId>, HardwareStatus> {
        let address = global_address(kAudioHardwarePropertyDevices);
        let system = DeviceId(kAudioObjectSystemObject);
        let mut size = Self::data_size(system, &address)?;

        let count = size as usize / mem::size_of::<AudioDeviceID>();
        let mut devices: Vec<AudioDeviceID> = vec![0; count];
        let status = unsafe {
            AudioObjectGetPropertyData(
                system.0,
                &address,
                0,
                ptr::null(),
                &mut size,
                devices.as_mut_ptr() as *mut c_void,
            )
        };
        Self::check(status)?;

        // The list can shrink between the two calls.
        devices.truncate(size as usize / mem::size_of::<AudioDeviceID>());
        Ok(devices.into_iter().map(DeviceId).collect())
    }

    fn default_output_device(&self) -> Result<Option<DeviceId>, HardwareStatus> {
        let address = global_address(kAudioHardwarePropertyDefaultOutputDevice);
        let id: AudioDeviceID =
            Self::read_value(DeviceId(kAudioObjectSystemObject), &address, 0)?;
        Ok((id != kAudioObjectUnknown).then_some(DeviceId(id)))
    }

    fn set_default_output_device(&self, device: DeviceId) -> Result<(), HardwareStatus> {
        let address = global_address(kAudioHardwarePropertyDefaultOutputDevice);
        Self::write_value(DeviceId(kAudioObjectSystemObject), &address, device.0)?;
        info!("Set default output device to {}", device);
        Ok(())
    }

    fn device_name(&self, device: DeviceId) -> Result<String, HardwareStatus> {
        Self::read_string(device, &global_address(kAudioObjectPropertyName))
    }

    fn device_uid(&self, device: DeviceId) -> Result<String, HardwareStatus> {
        Self::read_string(device, &global_address(kAudioDevicePropertyDeviceUID))
    }

    fn channel_count(&self, device: DeviceId, scope: Scope) -> Result<u32, HardwareStatus> {
        let address = AudioObjectPropertyAddress {
            mSelector: kAudioDevicePropertyStreamConfiguration,
            mScope: raw_scope(scope),
            mElement: kAudioObjectPropertyElementMain,
        };
        let mut size = Self::data_size(device, &address)?;
        if (size as usize) < mem::size_of::<AudioBufferList>() {
            return Ok(0);
        }

        // u64 storage keeps the buffer list suitably aligned.
        let mut storage = vec![0u64; (size as usize).div_ceil(mem::size_of::<u64>())];
        let status = unsafe {
            AudioObjectGetPropertyData(
                device.0,
                &address,
                0,
                ptr::null(),
                &mut size,
                storage.as_mut_ptr() as *mut c_void,
            )
        };
        Self::check(status)?;

        let channels = unsafe {
            let list = &*(storage.as_ptr() as *const AudioBufferList);
            std::slice::from_raw_parts(list.mBuffers.as_ptr(), list.mNumberBuffers as usize)
                .iter()
                .map(|buffer| buffer.mNumberChannels)
                .sum()
        };
        Ok(channels)
    }

    fn has_property(&self, device: DeviceId, address: PropertyAddress) -> bool {
        let address = raw_address(address);
        unsafe { AudioObjectHasProperty(device.0, &address) != 0 }
    }

    fn is_property_settable(
        &self,
        device: DeviceId,
        address: PropertyAddress,
    ) -> Result<bool, HardwareStatus> {
        let address = raw_address(address);
        let mut settable: Boolean = 0;
        let status = unsafe { AudioObjectIsPropertySettable(device.0, &address, &mut settable) };
        Self::check(status)?;
        Ok(settable != 0)
    }

    fn get_scalar(
        &self,
        device: DeviceId,
        address: PropertyAddress,
    ) -> Result<f32, HardwareStatus> {
        Self::read_value(device, &raw_address(address), 0.0f32)
    }

    fn set_scalar(
        &self,
        device: DeviceId,
        address: PropertyAddress,
        value: f32,
    ) -> Result<(), HardwareStatus> {
        Self::write_value(device, &raw_address(address), value)
    }

    fn get_u32(&self, device: DeviceId, address: PropertyAddress) -> Result<u32, HardwareStatus> {
        Self::read_value(device, &raw_address(address), 0u32)
    }

    fn set_u32(
        &self,
        device: DeviceId,
        address: PropertyAddress,
        value: u32,
    ) -> Result<(), HardwareStatus> {
        Self::write_value(device, &raw_address(address), value)
    }

    fn data_source_name(
        &self,
        device: DeviceId,
        scope: Scope,
        source: u32,
    ) -> Result<String, HardwareStatus> {
        let address = AudioObjectPropertyAddress {
            mSelector: kAudioDevicePropertyDataSourceNameForIDCFString,
            mScope: raw_scope(scope),
            mElement: kAudioObjectPropertyElementMain,
        };

        let mut source = source;
        let mut name: CFStringRef = ptr::null();
        let mut translation = AudioValueTranslation {
            mInputData: &mut source as *mut u32 as *mut c_void,
            mInputDataSize: mem::size_of::<u32>() as u32,
            mOutputData: &mut name as *mut CFStringRef as *mut c_void,
            mOutputDataSize: mem::size_of::<CFStringRef>() as u32,
        };
        let mut size = mem::size_of::<AudioValueTranslation>() as u32;
        let status = unsafe {
            AudioObjectGetPropertyData(
                device.0,
                &address,
                0,
                ptr::null(),
                &mut size,
                &mut translation as *mut AudioValueTranslation as *mut c_void,
            )
        };
        Self::check(status)?;

        if name.is_null() {
            return Err(HardwareStatus::UNSPECIFIED);
        }
        let name = unsafe { CFString::wrap_under_create_rule(name) };
        Ok(name.to_string())
    }

    fn add_property_listener(
        &self,
        object: DeviceId,
        address: PropertyAddress,
        callback: PropertyCallback,
    ) -> Result<ListenerId, HardwareStatus> {
        let raw = raw_address(address);
        let callback = Box::new(callback);
        let client_data = &*callback as *const PropertyCallback as *mut c_void;

        // Locked before registering: once CoreAudio holds `client_data`, the
        // box must end up in the map.
        let mut listeners = self
            .listeners
            .lock()
            .map_err(|_| HardwareStatus::UNSPECIFIED)?;
        let status = unsafe {
            AudioObjectAddPropertyListener(object.0, &raw, Some(property_listener), client_data)
        };
        Self::check(status)?;

        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        debug!("Registered CoreAudio listener {} for {} on {}", id, address, object);
        listeners.insert(
            id,
            RegisteredListener {
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
        address: PropertyAddress,
        listener: ListenerId,
    ) -> Result<(), HardwareStatus> {
        let mut listeners = self
            .listeners
            .lock()
            .map_err(|_| HardwareStatus::UNSPECIFIED)?;
        let Some(registered) = listeners.remove(&listener.0) else {
            return Err(HardwareStatus::ILLEGAL_OPERATION);
        };
        if registered.object != object || registered.address != address {
            warn!(
                "Listener {} belongs to {} on {}, not {} on {}",
                listener.0, registered.address, registered.object, address, object
            );
        }

        let raw = raw_address(registered.address);
        let client_data = &*registered.callback as *const PropertyCallback as *mut c_void;
        let status = unsafe {
            AudioObjectRemovePropertyListener(
                registered.object.0,
                &raw,
                Some(property_listener),
                client_data,
            )
        };
        // The box is dropped here either way. If removal failed the object is
        // gone, and CoreAudio will not call back into it.
        Self::check(status)
    }

    fn forget_property_listener(&self, listener: ListenerId) {
        let removed = match self.listeners.lock() {
            Ok(mut listeners) => listeners.remove(&listener.0),
            Err(poisoned) => poisoned.into_inner().remove(&listener.0),
        };
        if let Some(registered) = removed {
            debug!(
                "Forgetting CoreAudio listener {} for {} on {}",
                listener.0, registered.address, registered.object
            );
        }
    }
}

impl Drop for CoreAudioHardware {
    fn drop(&mut self) {
        let listeners = match self.listeners.get_mut() {
            Ok(listeners) => mem::take(listeners),
            Err(poisoned) => mem::take(poisoned.into_inner()),
        };
        for (_, registered) in listeners {
            let raw = raw_address(registered.address);
            let client_data = &*registered.callback as *const PropertyCallback as *mut c_void;
            unsafe {
                AudioObjectRemovePropertyListener(
                    registered.object.0,
                    &raw,
                    Some(property_listener),
                    client_data,
                );
            }
        }
    }
}

// CoreAudio callback function
extern "C" fn property_listener(
    _in_object_id: AudioObjectID,
    _in_number_addresses: UInt32,
    _in_addresses: *const AudioObjectPropertyAddress,
    in_client_data: *mut c_void,
) -> OSStatus {
    if !in_client_data.is_null() {
        let callback = unsafe { &*(in_client_data as *const PropertyCallback) };
        callback();
    }
    NO_ERROR
}
