use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

use crate::audio::DeviceId;
use crate::error::CoordinatorError;

/// The persisted output device preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    /// UID of the device the user explicitly chose, if any
    #[serde(default)]
    pub preferred_output_uid: Option<String>,

    /// Whether a newly connected output device takes over
    #[serde(default = "default_most_recent_wins")]
    pub most_recent_wins: bool,
}

fn default_most_recent_wins() -> bool {
    true
}

impl Default for PreferenceRecord {
    fn default() -> Self {
        Self {
            preferred_output_uid: None,
            most_recent_wins: default_most_recent_wins(),
        }
    }
}

/// What caused a selection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Startup,
    /// A device appeared in the device list
    DeviceConnected(DeviceId),
    /// Devices were removed, or changed without a new output device appearing
    DeviceListChanged,
    UserChoice,
    PreferenceChanged,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Startup => write!(f, "startup"),
            Trigger::DeviceConnected(id) => write!(f, "device {} connected", id),
            Trigger::DeviceListChanged => write!(f, "device list changed"),
            Trigger::UserChoice => write!(f, "user choice"),
            Trigger::PreferenceChanged => write!(f, "preference changed"),
        }
    }
}

/// One entry of the device list as seen by the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub id: DeviceId,
    pub uid: Option<String>,
    pub supports_output: bool,
}

impl DeviceCandidate {
    pub fn new(id: DeviceId, uid: Option<String>, supports_output: bool) -> Self {
        Self {
            id,
            uid,
            supports_output,
        }
    }
}

/// Everything one selection run depends on.
#[derive(Debug, Clone)]
pub struct SelectionInput<'a> {
    /// Device list in enumeration order
    pub devices: &'a [DeviceCandidate],
    pub preference: &'a PreferenceRecord,
    pub trigger: Trigger,
    /// The output device before this run
    pub previous: Option<DeviceId>,
    pub system_default: Option<DeviceId>,
    /// Never selected
    pub virtual_device: DeviceId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionRule {
    ExplicitPreference,
    MostRecentlyConnected,
    KeepPrevious,
    SystemDefault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    pub device: DeviceId,
    pub rule: SelectionRule,
}

impl DeviceCandidate {
    fn is_usable(&self, virtual_device: DeviceId) -> bool {
        self.id != virtual_device && self.supports_output
    }
}

impl<'a> SelectionInput<'a> {
    fn usable(&self, id: DeviceId) -> Option<&'a DeviceCandidate> {
        self.devices
            .iter()
            .find(|d| d.id == id && d.is_usable(self.virtual_device))
    }
}

/// Decide which real device should be the output device.
///
/// Rules are tried in order and the first match wins. When several devices
/// match a rule, the one enumerated first is chosen.
pub fn select_output_device(input: &SelectionInput<'_>) -> Result<Selection, CoordinatorError> {
    debug!(
        "Selecting output device from {} devices ({})",
        input.devices.len(),
        input.trigger
    );

    // 1. Explicit preference
    if let Some(uid) = input.preference.preferred_output_uid.as_deref() {
        let preferred = input.devices.iter().find(|d| {
            d.uid.as_deref() == Some(uid) && d.is_usable(input.virtual_device)
        });
        if let Some(device) = preferred {
            return Ok(selected(device.id, SelectionRule::ExplicitPreference));
        }
        debug!("Preferred output device '{}' is not available", uid);
    }

    // 2. Most recently connected
    if let Trigger::DeviceConnected(id) = input.trigger {
        if !input.preference.most_recent_wins {
            debug!("Most-recent-wins disabled, ignoring connection of {}", id);
        } else if let Some(device) = input.usable(id) {
            return Ok(selected(device.id, SelectionRule::MostRecentlyConnected));
        }
    }

    // 3. Keep what we had
    if let Some(device) = input.previous.and_then(|id| input.usable(id)) {
        return Ok(selected(device.id, SelectionRule::KeepPrevious));
    }

    // 4. System default
    if let Some(device) = input.system_default.and_then(|id| input.usable(id)) {
        return Ok(selected(device.id, SelectionRule::SystemDefault));
    }

    info!("No usable output device among {} devices", input.devices.len());
    Err(CoordinatorError::NoOutputDeviceAvailable)
}

/// The device to hand the selector as the system default.
///
/// `reported` is what the platform says, which is the virtual device itself
/// while routing is on. When it is not a usable real device, `recorded` (the
/// default from before routing started) is tried, then the first usable
/// output device in enumeration order.
pub fn effective_system_default(
    devices: &[DeviceCandidate],
    reported: Option<DeviceId>,
    recorded: Option<DeviceId>,
    virtual_device: DeviceId,
) -> Option<DeviceId> {
    let usable = |id: &DeviceId| {
        devices
            .iter()
            .any(|d| d.id == *id && d.is_usable(virtual_device))
    };

    reported
        .filter(usable)
        .or_else(|| recorded.filter(usable))
        .or_else(|| {
            let fallback = devices
                .iter()
                .find(|d| d.is_usable(virtual_device))
                .map(|d| d.id);
            if let Some(id) = fallback {
                debug!("System default unusable, standing in with {}", id);
            }
            fallback
        })
}

fn selected(device: DeviceId, rule: SelectionRule) -> Selection {
    debug!("Selected output device {} by rule {:?}", device, rule);
    Selection { device, rule }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIRTUAL: DeviceId = DeviceId(2);

    fn devices() -> Vec<DeviceCandidate> {
        vec![
            DeviceCandidate::new(VIRTUAL, Some("VirtualDevice".to_string()), true),
            DeviceCandidate::new(DeviceId(10), Some("speakers".to_string()), true),
            DeviceCandidate::new(DeviceId(11), Some("mic".to_string()), false),
            DeviceCandidate::new(DeviceId(12), Some("headphones".to_string()), true),
        ]
    }

    fn input<'a>(
        devices: &'a [DeviceCandidate],
        preference: &'a PreferenceRecord,
        trigger: Trigger,
    ) -> SelectionInput<'a> {
        SelectionInput {
            devices,
            preference,
            trigger,
            previous: None,
            system_default: None,
            virtual_device: VIRTUAL,
        }
    }

    #[test]
    fn test_default_preference_enables_most_recent_wins() {
        let preference = PreferenceRecord::default();
        assert!(preference.most_recent_wins);
        assert!(preference.preferred_output_uid.is_none());
    }

    #[test]
    fn test_input_only_device_is_never_selected() {
        let devices = devices();
        let preference = PreferenceRecord {
            preferred_output_uid: Some("mic".to_string()),
            most_recent_wins: true,
        };
        let mut input = input(&devices, &preference, Trigger::DeviceConnected(DeviceId(11)));
        input.system_default = Some(DeviceId(11));

        assert_eq!(
            select_output_device(&input),
            Err(CoordinatorError::NoOutputDeviceAvailable)
        );
    }

    #[test]
    fn test_virtual_device_is_never_selected() {
        let devices = devices();
        let preference = PreferenceRecord {
            preferred_output_uid: Some("VirtualDevice".to_string()),
            most_recent_wins: true,
        };
        let mut input = input(&devices, &preference, Trigger::Startup);
        input.system_default = Some(VIRTUAL);
        input.previous = Some(VIRTUAL);

        assert!(select_output_device(&input).is_err());
    }

    #[test]
    fn test_effective_default_prefers_reported_device() {
        let devices = devices();
        assert_eq!(
            effective_system_default(&devices, Some(DeviceId(12)), Some(DeviceId(10)), VIRTUAL),
            Some(DeviceId(12))
        );
    }

    #[test]
    fn test_effective_default_replaces_virtual_with_recorded() {
        let devices = devices();
        assert_eq!(
            effective_system_default(&devices, Some(VIRTUAL), Some(DeviceId(12)), VIRTUAL),
            Some(DeviceId(12))
        );
    }

    #[test]
    fn test_effective_default_falls_back_to_first_output() {
        let devices = devices();

        // Recorded default unplugged, input-only default
        assert_eq!(
            effective_system_default(&devices, Some(VIRTUAL), Some(DeviceId(99)), VIRTUAL),
            Some(DeviceId(10))
        );
        assert_eq!(
            effective_system_default(&devices, Some(DeviceId(11)), None, VIRTUAL),
            Some(DeviceId(10))
        );
        assert_eq!(
            effective_system_default(&devices[..1], Some(VIRTUAL), None, VIRTUAL),
            None
        );
    }
}
