//! Property change subscriptions and the serialization point they feed.
//!
//! Platform callbacks arrive on arbitrary threads. Each one is turned into a
//! task on a [`SerialQueue`], and the owner of the queue runs the tasks one at
//! a time, in the order they were queued.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::device::{AudioDevice, DeviceId, PropertyAddress};
use crate::error::DeviceError;
use crate::system::{ListenerId, PropertyCallback};

/// Work for the owner of a serialization point.
pub type Task<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Sending side of a serialization point.
pub struct SerialQueue<T> {
    sender: mpsc::UnboundedSender<Task<T>>,
}

impl<T> Clone for SerialQueue<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T: 'static> SerialQueue<T> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Task<T>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queue a task. Returns false if the owner has gone away.
    pub fn submit<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        self.sender.send(Box::new(task)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Run every task currently queued against `target`. Returns how many ran.
pub fn run_pending<T>(receiver: &mut mpsc::UnboundedReceiver<Task<T>>, target: &mut T) -> usize {
    let mut ran = 0;
    while let Ok(task) = receiver.try_recv() {
        task(target);
        ran += 1;
    }
    ran
}

struct Subscription {
    device: AudioDevice,
    listener: ListenerId,
    // Cleared on unsubscribe so that changes already queued are not delivered.
    active: Arc<AtomicBool>,
}

/// Tracks live property subscriptions, at most one per (device, property, scope).
pub struct PropertyListenerRegistry<T> {
    queue: SerialQueue<T>,
    subscriptions: HashMap<(DeviceId, PropertyAddress), Subscription>,
}

impl<T: 'static> PropertyListenerRegistry<T> {
    pub fn new(queue: SerialQueue<T>) -> Self {
        Self {
            queue,
            subscriptions: HashMap::new(),
        }
    }

    /// Call `callback` on the serialization point whenever `address` changes on `device`.
    ///
    /// Subscribing to a pair that is already subscribed does nothing, the
    /// original callback stays in place.
    pub fn subscribe<F>(
        &mut self,
        device: &AudioDevice,
        address: PropertyAddress,
        callback: F,
    ) -> Result<(), DeviceError>
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        let key = (device.id(), address);
        if self.subscriptions.contains_key(&key) {
            debug!("Already listening for {} on {}", address, device.id());
            return Ok(());
        }

        if !device.exists() {
            return Err(DeviceError::DeviceUnavailable {
                device: device.id(),
            });
        }

        let active = Arc::new(AtomicBool::new(true));
        let callback = Arc::new(callback);
        let queue = self.queue.clone();
        let task_active = Arc::clone(&active);
        let platform_callback: PropertyCallback = Arc::new(move || {
            let active = Arc::clone(&task_active);
            let callback = Arc::clone(&callback);
            let queued = queue.submit(move |target| {
                if active.load(Ordering::Acquire) {
                    callback(target);
                }
            });
            if !queued {
                debug!("Dropping property change for {}, coordinator is gone", address);
            }
        });

        let listener = device
            .hardware()
            .add_property_listener(device.id(), address, platform_callback)
            .map_err(|status| {
                if status.is_missing_object() || !device.exists() {
                    DeviceError::DeviceUnavailable {
                        device: device.id(),
                    }
                } else {
                    DeviceError::HardwareError {
                        device: device.id(),
                        operation: "add property listener",
                        status,
                    }
                }
            })?;

        debug!("Listening for {} on {}", address, device.id());
        self.subscriptions.insert(
            key,
            Subscription {
                device: device.clone(),
                listener,
                active,
            },
        );
        Ok(())
    }

    /// Remove the subscription for `address` on `device`, if there is one.
    ///
    /// Never fails. A device that has already left the device list is not
    /// asked to remove anything, its listeners went with it.
    pub fn unsubscribe(&mut self, device: DeviceId, address: PropertyAddress) {
        let Some(subscription) = self.subscriptions.remove(&(device, address)) else {
            debug!("Not listening for {} on {}, nothing to remove", address, device);
            return;
        };

        subscription.active.store(false, Ordering::Release);

        if !subscription.device.exists() {
            debug!("{} is gone, dropping its {} listener", device, address);
            subscription
                .device
                .hardware()
                .forget_property_listener(subscription.listener);
            return;
        }

        if let Err(status) = subscription.device.hardware().remove_property_listener(
            device,
            address,
            subscription.listener,
        ) {
            warn!(
                "Failed to remove {} listener from {}: {}",
                address, device, status
            );
        } else {
            debug!("Stopped listening for {} on {}", address, device);
        }
    }

    /// Move the subscription for `address` from `old` to `new` in one step.
    pub fn swap_device<F>(
        &mut self,
        old: Option<DeviceId>,
        new: &AudioDevice,
        address: PropertyAddress,
        callback: F,
    ) -> Result<(), DeviceError>
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        if let Some(old) = old {
            if old != new.id() {
                self.unsubscribe(old, address);
            }
        }
        self.subscribe(new, address, callback)
    }

    pub fn is_subscribed(&self, device: DeviceId, address: PropertyAddress) -> bool {
        self.subscriptions.contains_key(&(device, address))
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn unsubscribe_all(&mut self) {
        let keys: Vec<_> = self.subscriptions.keys().copied().collect();
        info!("Removing {} property listeners", keys.len());
        for (device, address) in keys {
            self.unsubscribe(device, address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{MockAudioHardware, MockDevice};

    struct Fixture {
        hardware: Arc<MockAudioHardware>,
        registry: PropertyListenerRegistry<u32>,
        receiver: mpsc::UnboundedReceiver<Task<u32>>,
        device: AudioDevice,
    }

    fn fixture() -> Fixture {
        let hardware = Arc::new(MockAudioHardware::new());
        hardware.add_device(MockDevice::output(20, "usb-uid", "USB DAC").with_volume(0.3));
        let (queue, receiver) = SerialQueue::new();
        let device = AudioDevice::new(DeviceId(20), hardware.clone());
        Fixture {
            hardware,
            registry: PropertyListenerRegistry::new(queue),
            receiver,
            device,
        }
    }

    #[test]
    fn test_duplicate_subscribe_delivers_once() {
        let mut f = fixture();
        let address = PropertyAddress::output_volume();

        f.registry.subscribe(&f.device, address, |n| *n += 1).unwrap();
        f.registry.subscribe(&f.device, address, |n| *n += 1).unwrap();
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.hardware.listener_count(DeviceId(20), address), 1);

        f.hardware.fire_property_change(DeviceId(20), address);
        let mut count = 0;
        run_pending(&mut f.receiver, &mut count);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_unsubscribe_unknown_is_noop() {
        let mut f = fixture();
        f.registry
            .unsubscribe(DeviceId(20), PropertyAddress::output_mute());
        f.registry
            .unsubscribe(DeviceId(404), PropertyAddress::output_volume());
        assert!(f.registry.is_empty());
    }

    #[test]
    fn test_unsubscribe_after_removal_skips_platform() {
        let mut f = fixture();
        let address = PropertyAddress::output_volume();
        f.registry.subscribe(&f.device, address, |n| *n += 1).unwrap();

        f.hardware.remove_device(DeviceId(20));
        assert_eq!(f.hardware.retained_listener_count(), 1);
        f.registry.unsubscribe(DeviceId(20), address);

        assert!(f.registry.is_empty());
        assert_eq!(f.hardware.remove_listener_calls(), 0);
        assert_eq!(f.hardware.retained_listener_count(), 0);
    }

    #[test]
    fn test_subscribe_to_removed_device_fails() {
        let mut f = fixture();
        f.hardware.remove_device(DeviceId(20));
        let result = f
            .registry
            .subscribe(&f.device, PropertyAddress::output_volume(), |n| *n += 1);
        assert_eq!(
            result,
            Err(DeviceError::DeviceUnavailable {
                device: DeviceId(20)
            })
        );
    }

    #[test]
    fn test_queued_change_dropped_after_unsubscribe() {
        let mut f = fixture();
        let address = PropertyAddress::output_volume();
        f.registry.subscribe(&f.device, address, |n| *n += 1).unwrap();

        f.hardware.fire_property_change(DeviceId(20), address);
        f.registry.unsubscribe(DeviceId(20), address);

        let mut count = 0;
        assert_eq!(run_pending(&mut f.receiver, &mut count), 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_swap_device_moves_subscription() {
        let mut f = fixture();
        f.hardware
            .add_device(MockDevice::output(21, "hp-uid", "Headphones").with_volume(0.8));
        let other = AudioDevice::new(DeviceId(21), f.hardware.clone());
        let address = PropertyAddress::output_volume();

        f.registry.subscribe(&f.device, address, |n| *n += 1).unwrap();
        f.registry
            .swap_device(Some(DeviceId(20)), &other, address, |n| *n += 10)
            .unwrap();

        assert!(!f.registry.is_subscribed(DeviceId(20), address));
        assert!(f.registry.is_subscribed(DeviceId(21), address));

        f.hardware.fire_property_change(DeviceId(20), address);
        f.hardware.fire_property_change(DeviceId(21), address);
        let mut count = 0;
        run_pending(&mut f.receiver, &mut count);
        assert_eq!(count, 10);
    }
}
