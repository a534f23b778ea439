//! Test utility builders for creating mock hardware rigs and selector inputs
//!
//! Individual methods may not be used by all tests, so dead code warnings are suppressed.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use audio_output_coordinator::audio::{DeviceCoordinator, DeviceId};
use audio_output_coordinator::error::CoordinatorError;
use audio_output_coordinator::priority::{DeviceCandidate, PreferenceRecord};
use audio_output_coordinator::system::{
    MockAudioHardware, MockDevice, MockPreferenceStore, MockVirtualDevice,
};

pub const VIRTUAL_ID: DeviceId = DeviceId(2);
pub const VIRTUAL_UID: &str = "AudioOutputCoordinatorDevice_UID";

/// Output device changes seen by a subscriber, as (old, new) IDs
pub type ChangeLog = Arc<Mutex<Vec<(Option<DeviceId>, DeviceId)>>>;

/// A coordinator wired to mock hardware, with every collaborator exposed
pub struct CoordinatorRig {
    pub hardware: Arc<MockAudioHardware>,
    pub provider: Arc<MockVirtualDevice>,
    pub store: Arc<MockPreferenceStore>,
    pub coordinator: DeviceCoordinator,
    pub changes: ChangeLog,
}

impl CoordinatorRig {
    /// Register listeners and choose the initial output device
    pub fn start(&mut self) -> Result<DeviceId, CoordinatorError> {
        self.coordinator
            .start_listening()
            .expect("listeners should register on mock hardware");
        let device = self.coordinator.choose_initial_output_device()?;
        Ok(device.id())
    }

    /// Run everything queued on the serialization point
    pub fn settle(&mut self) -> Result<usize, CoordinatorError> {
        self.coordinator.process_pending()
    }

    pub fn current(&self) -> Option<DeviceId> {
        self.coordinator.current_output_device().map(|d| d.id())
    }

    pub fn changes(&self) -> Vec<(Option<DeviceId>, DeviceId)> {
        self.changes.lock().unwrap().clone()
    }
}

/// Builder for creating CoordinatorRig instances
pub struct CoordinatorRigBuilder {
    devices: Vec<MockDevice>,
    default_output: Option<DeviceId>,
    preference: PreferenceRecord,
}

impl CoordinatorRigBuilder {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            default_output: None,
            preference: PreferenceRecord::default(),
        }
    }

    pub fn device(mut self, device: MockDevice) -> Self {
        self.devices.push(device);
        self
    }

    /// Plain output device with volume and mute controls
    pub fn output(self, id: u32, uid: &str) -> Self {
        self.device(
            MockDevice::output(id, uid, &format!("Output {}", id))
                .with_volume(0.5)
                .with_mute(false),
        )
    }

    pub fn input(self, id: u32, uid: &str) -> Self {
        self.device(MockDevice::input(id, uid, &format!("Input {}", id)))
    }

    pub fn default_output(mut self, id: u32) -> Self {
        self.default_output = Some(DeviceId(id));
        self
    }

    pub fn preferred(mut self, uid: &str) -> Self {
        self.preference.preferred_output_uid = Some(uid.to_string());
        self
    }

    pub fn most_recent_wins(mut self, enabled: bool) -> Self {
        self.preference.most_recent_wins = enabled;
        self
    }

    pub fn build(self) -> CoordinatorRig {
        let hardware = Arc::new(MockAudioHardware::new());
        hardware.add_device(
            MockDevice::output(VIRTUAL_ID.0, VIRTUAL_UID, "Virtual Output")
                .with_volume(0.5)
                .with_mute(false),
        );
        for device in self.devices {
            hardware.add_device(device);
        }
        hardware.set_mock_default_output(self.default_output);

        let provider = Arc::new(MockVirtualDevice::new(Arc::clone(&hardware), VIRTUAL_ID));
        let store = Arc::new(MockPreferenceStore::new(self.preference));
        let mut coordinator =
            DeviceCoordinator::new(hardware.clone(), provider.clone(), store.clone());

        let changes: ChangeLog = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&changes);
        coordinator.on_output_device_changed(move |old, new| {
            log.lock().unwrap().push((old.map(|d| d.id()), new.id()));
            Ok(())
        });

        CoordinatorRig {
            hardware,
            provider,
            store,
            coordinator,
            changes,
        }
    }
}

impl Default for CoordinatorRigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for selector device lists, in enumeration order
pub struct CandidateListBuilder {
    devices: Vec<DeviceCandidate>,
}

impl CandidateListBuilder {
    pub fn new() -> Self {
        Self {
            devices: vec![DeviceCandidate::new(
                VIRTUAL_ID,
                Some(VIRTUAL_UID.to_string()),
                true,
            )],
        }
    }

    pub fn output(mut self, id: u32, uid: &str) -> Self {
        self.devices
            .push(DeviceCandidate::new(DeviceId(id), Some(uid.to_string()), true));
        self
    }

    pub fn input(mut self, id: u32, uid: &str) -> Self {
        self.devices
            .push(DeviceCandidate::new(DeviceId(id), Some(uid.to_string()), false));
        self
    }

    /// A device whose UID could not be read
    pub fn anonymous_output(mut self, id: u32) -> Self {
        self.devices.push(DeviceCandidate::new(DeviceId(id), None, true));
        self
    }

    pub fn build(self) -> Vec<DeviceCandidate> {
        self.devices
    }
}

impl Default for CandidateListBuilder {
    fn default() -> Self {
        Self::new()
    }
}
