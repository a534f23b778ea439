pub mod control_sync;
pub mod coordinator;
pub mod device;
pub mod listener;

pub use control_sync::ControlSync;
pub use coordinator::{CoordinatorHandle, DeviceCoordinator, OutputDeviceSubscriber, SubscriberId};
pub use device::{
    AudioDevice, Capabilities, Channel, DeviceId, GENERIC_DEVICE_NAME, Property, PropertyAddress,
    Scope,
};
pub use listener::{PropertyListenerRegistry, SerialQueue, Task, run_pending};
