pub mod audio;
pub mod config;
pub mod error;
pub mod logging;
pub mod priority;
pub mod service;
pub mod system;

pub use audio::{AudioDevice, CoordinatorHandle, DeviceCoordinator, DeviceId};
pub use config::Config;
pub use error::{CoordinatorError, DeviceError, HardwareStatus};
pub use priority::{PreferenceRecord, Trigger, select_output_device};
pub use service::OutputRoutingService;
