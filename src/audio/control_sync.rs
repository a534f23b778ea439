use std::sync::Arc;
use tracing::{debug, info, warn};

use super::device::{AudioDevice, Channel, Scope};
use crate::error::DeviceError;
use crate::system::VirtualDeviceProvider;

/// Volume differences below this are treated as equal, which stops the two
/// directions of the sync from echoing each other forever.
pub const VOLUME_TOLERANCE: f32 = 0.0005;

/// Keeps the virtual device's output volume and mute in step with the real
/// output device.
///
/// Only the virtual device is ever written from the output device. Real
/// devices never receive each other's volume.
pub struct ControlSync {
    provider: Arc<dyn VirtualDeviceProvider>,
    virtual_device: AudioDevice,
}

impl ControlSync {
    pub fn new(provider: Arc<dyn VirtualDeviceProvider>) -> Self {
        let virtual_device = provider.device();
        Self {
            provider,
            virtual_device,
        }
    }

    pub fn virtual_device(&self) -> &AudioDevice {
        &self.virtual_device
    }

    /// Called when `output` becomes the output device.
    pub fn attach(&self, output: &AudioDevice) {
        let has_volume = output
            .has_volume(Scope::Output, Channel::Master)
            .unwrap_or_else(|e| swallowed("volume capability", e, false));
        let has_mute = output
            .has_mute(Scope::Output, Channel::Master)
            .unwrap_or_else(|e| swallowed("mute capability", e, false));

        info!(
            "Virtual device controls for {}: volume {}, mute {}",
            output.id(),
            if has_volume { "enabled" } else { "disabled" },
            if has_mute { "enabled" } else { "disabled" }
        );
        if let Err(e) = self.provider.set_output_controls_enabled(has_volume, has_mute) {
            warn!("Failed to update virtual device controls: {}", e);
        }

        self.pull_from_output(output);
    }

    /// Virtual device changed: apply its volume and mute to `output`.
    pub fn push_to_output(&self, output: &AudioDevice) {
        copy_volume(&self.virtual_device, output);
        copy_mute(&self.virtual_device, output);
    }

    /// Output device changed on its own: show its volume and mute on the virtual device.
    pub fn pull_from_output(&self, output: &AudioDevice) {
        copy_volume(output, &self.virtual_device);
        copy_mute(output, &self.virtual_device);
    }
}

fn copy_volume(from: &AudioDevice, to: &AudioDevice) {
    let Ok(true) = from.has_volume(Scope::Output, Channel::Master) else {
        return;
    };
    let Ok(true) = to.has_volume(Scope::Output, Channel::Master) else {
        return;
    };

    let volume = match from.volume(Scope::Output, Channel::Master) {
        Ok(volume) => volume,
        Err(e) => return swallowed("read volume", e, ()),
    };

    match to.volume(Scope::Output, Channel::Master) {
        Ok(current) if (current - volume).abs() < VOLUME_TOLERANCE => return,
        Ok(_) => {}
        Err(e) => return swallowed("read volume", e, ()),
    }

    debug!("Copying volume {:.3} from {} to {}", volume, from.id(), to.id());
    if let Err(e) = to.set_volume(Scope::Output, Channel::Master, volume) {
        swallowed("set volume", e, ());
    }
}

fn copy_mute(from: &AudioDevice, to: &AudioDevice) {
    let Ok(true) = from.has_mute(Scope::Output, Channel::Master) else {
        return;
    };
    let Ok(true) = to.has_mute(Scope::Output, Channel::Master) else {
        return;
    };

    let muted = match from.is_muted(Scope::Output, Channel::Master) {
        Ok(muted) => muted,
        Err(e) => return swallowed("read mute", e, ()),
    };

    match to.is_muted(Scope::Output, Channel::Master) {
        Ok(current) if current == muted => return,
        Ok(_) => {}
        Err(e) => return swallowed("read mute", e, ()),
    }

    debug!("Copying mute {} from {} to {}", muted, from.id(), to.id());
    if let Err(e) = to.set_mute(Scope::Output, Channel::Master, muted) {
        swallowed("set mute", e, ());
    }
}

fn swallowed<T>(operation: &str, error: DeviceError, fallback: T) -> T {
    if error.is_expected() {
        debug!("Control sync {} skipped: {}", operation, error);
    } else {
        warn!("Control sync {} failed: {}", operation, error);
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::DeviceId;
    use crate::error::HardwareStatus;
    use crate::system::{MockAudioHardware, MockDevice, MockVirtualDevice};

    fn setup() -> (Arc<MockAudioHardware>, Arc<MockVirtualDevice>, ControlSync) {
        let hardware = Arc::new(MockAudioHardware::new());
        hardware.add_device(
            MockDevice::output(2, "VirtualDevice", "Virtual Device")
                .with_volume(0.5)
                .with_mute(false),
        );
        hardware.add_device(
            MockDevice::output(10, "speakers", "Speakers")
                .with_volume(0.25)
                .with_mute(true),
        );
        hardware.add_device(MockDevice::output(11, "hdmi", "HDMI"));
        let provider = Arc::new(MockVirtualDevice::new(hardware.clone(), DeviceId(2)));
        let sync = ControlSync::new(provider.clone());
        (hardware, provider, sync)
    }

    #[test]
    fn test_attach_copies_output_state_to_virtual() {
        let (hardware, provider, sync) = setup();
        let speakers = AudioDevice::new(DeviceId(10), hardware);

        sync.attach(&speakers);

        let virtual_device = sync.virtual_device();
        assert_eq!(virtual_device.volume(Scope::Output, Channel::Master).unwrap(), 0.25);
        assert!(virtual_device.is_muted(Scope::Output, Channel::Master).unwrap());
        assert_eq!(provider.controls_enabled(), Some((true, true)));
    }

    #[test]
    fn test_attach_disables_controls_for_fixed_volume_device() {
        let (hardware, provider, sync) = setup();
        let hdmi = AudioDevice::new(DeviceId(11), hardware);

        sync.attach(&hdmi);

        assert_eq!(provider.controls_enabled(), Some((false, false)));
        assert_eq!(
            sync.virtual_device()
                .volume(Scope::Output, Channel::Master)
                .unwrap(),
            0.5
        );
    }

    #[test]
    fn test_push_to_output() {
        let (hardware, _provider, sync) = setup();
        let speakers = AudioDevice::new(DeviceId(10), hardware);

        sync.virtual_device()
            .set_volume(Scope::Output, Channel::Master, 0.9)
            .unwrap();
        sync.push_to_output(&speakers);

        assert_eq!(speakers.volume(Scope::Output, Channel::Master).unwrap(), 0.9);
        assert!(!speakers.is_muted(Scope::Output, Channel::Master).unwrap());
    }

    #[test]
    fn test_equal_values_are_not_rewritten() {
        let (hardware, _provider, sync) = setup();
        let speakers = AudioDevice::new(DeviceId(10), hardware.clone());
        sync.pull_from_output(&speakers);

        let writes_before = hardware.write_count();
        sync.push_to_output(&speakers);
        assert_eq!(hardware.write_count(), writes_before);
    }

    #[test]
    fn test_removed_output_is_ignored() {
        let (hardware, _provider, sync) = setup();
        let speakers = AudioDevice::new(DeviceId(10), hardware.clone());
        hardware.remove_device(DeviceId(10));

        sync.push_to_output(&speakers);
        sync.attach(&speakers);
    }

    #[test]
    fn test_hardware_errors_are_swallowed() {
        let (hardware, provider, sync) = setup();
        let speakers = AudioDevice::new(DeviceId(10), hardware.clone());
        hardware.fail_property_access(Some(HardwareStatus::UNSPECIFIED));

        sync.attach(&speakers);
        sync.push_to_output(&speakers);
        sync.pull_from_output(&speakers);

        assert_eq!(provider.controls_enabled(), Some((true, true)));
        assert_eq!(hardware.write_count(), 0);

        hardware.fail_property_access(None);
        sync.pull_from_output(&speakers);
        assert_eq!(hardware.device_volume(DeviceId(2)), Some(0.25));
    }
}
