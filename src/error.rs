//! Error types for the output coordinator.
//!
//! Errors fall into two groups:
//! - **Device errors** ([`DeviceError`]): local to one device operation. They are
//!   handled where they occur and never reach the user.
//! - **Coordinator errors** ([`CoordinatorError`]): fatal conditions that are
//!   reported to the top level exactly once.

use std::fmt;

use crate::audio::DeviceId;

/// Status code reported by the audio hardware layer (an `OSStatus` on macOS).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareStatus(pub i32);

impl HardwareStatus {
    /// `kAudioHardwareUnspecifiedError` ('what')
    pub const UNSPECIFIED: Self = Self(0x7768_6174);
    /// `kAudioHardwareUnknownPropertyError` ('who?')
    pub const UNKNOWN_PROPERTY: Self = Self(0x7768_6F3F);
    /// `kAudioHardwareBadObjectError` ('!obj')
    pub const BAD_OBJECT: Self = Self(0x216F_626A);
    /// `kAudioHardwareBadDeviceError` ('!dev')
    pub const BAD_DEVICE: Self = Self(0x2164_6576);
    /// `kAudioHardwareIllegalOperationError` ('nope')
    pub const ILLEGAL_OPERATION: Self = Self(0x6E6F_7065);
    /// `kAudioHardwareUnsupportedOperationError` ('unop')
    pub const UNSUPPORTED_OPERATION: Self = Self(0x756E_6F70);

    /// True when the status means the object is gone rather than misbehaving.
    pub fn is_missing_object(self) -> bool {
        self == Self::BAD_OBJECT || self == Self::BAD_DEVICE
    }
}

impl fmt::Display for HardwareStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            write!(f, "'{}' ({})", String::from_utf8_lossy(&bytes), self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Failure of a single operation against one device.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DeviceError {
    /// The device is not in the system device list (any more).
    #[error("device {device} is not available")]
    DeviceUnavailable { device: DeviceId },

    /// The device exists but lacks the capability the operation needs.
    #[error("device {device} does not support {operation}")]
    UnsupportedOperation {
        device: DeviceId,
        operation: &'static str,
    },

    /// The platform failed a call that is documented as not failing.
    #[error("hardware error on device {device} during {operation}: {status}")]
    HardwareError {
        device: DeviceId,
        operation: &'static str,
        status: HardwareStatus,
    },
}

impl DeviceError {
    /// Expected failures are recovered by the next reconciliation pass or by a
    /// capability fallback. Everything else is logged and dropped.
    pub fn is_expected(&self) -> bool {
        !matches!(self, DeviceError::HardwareError { .. })
    }

    pub fn device(&self) -> DeviceId {
        match self {
            DeviceError::DeviceUnavailable { device }
            | DeviceError::UnsupportedOperation { device, .. }
            | DeviceError::HardwareError { device, .. } => *device,
        }
    }
}

/// Fatal errors surfaced by the coordinator to its owner.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    /// No device in the system can be used as the output device.
    #[error("no usable output device is available")]
    NoOutputDeviceAvailable,

    /// The permission gate denied access to audio input.
    #[error("permission to access audio was denied (check OS privacy settings)")]
    PermissionDenied,

    /// The virtual device provider reported a failure; the message is its own.
    #[error("{0}")]
    VirtualDevice(String),

    /// The serialization point is gone, so the request could not be queued.
    #[error("the coordinator has shut down")]
    Shutdown,
}
