pub mod loader;
pub mod types;

pub use loader::{ConfigLoader, ConfigPreferenceStore};
pub use types::{Config, DEFAULT_VIRTUAL_DEVICE_UID, GeneralConfig, LoggingSection, VirtualDeviceConfig};
