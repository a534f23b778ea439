use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::control_sync::ControlSync;
use super::device::{AudioDevice, DeviceId, PropertyAddress};
use super::listener::{PropertyListenerRegistry, SerialQueue, Task};
use crate::error::{CoordinatorError, DeviceError};
use crate::priority::{
    DeviceCandidate, PreferenceRecord, SelectionInput, Trigger, effective_system_default,
    select_output_device,
};
use crate::system::{AudioHardware, PreferenceStore, VirtualDeviceProvider};

/// Receives `(old, new)` each time the output device changes. Runs on the
/// serialization point, so it must return quickly.
pub type OutputDeviceSubscriber =
    Box<dyn FnMut(Option<&AudioDevice>, &AudioDevice) -> anyhow::Result<()> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Properties watched on the current output device.
const OUTPUT_CONTROLS: [PropertyAddress; 2] = [
    PropertyAddress::output_volume(),
    PropertyAddress::output_mute(),
];

/// Lock-free copy of the current output device ID for readers on other threads.
#[derive(Debug, Default)]
struct CurrentDeviceCell(AtomicU32);

impl CurrentDeviceCell {
    fn load(&self) -> Option<DeviceId> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            id => Some(DeviceId(id)),
        }
    }

    fn store(&self, device: Option<DeviceId>) {
        let raw = device.map_or(DeviceId::UNKNOWN.0, |d| d.0);
        self.0.store(raw, Ordering::Release);
    }
}

/// Cloneable, thread-safe access to a running [`DeviceCoordinator`].
///
/// Reads come from an atomic snapshot. Anything that changes state is queued
/// onto the coordinator's serialization point.
#[derive(Clone)]
pub struct CoordinatorHandle {
    queue: SerialQueue<DeviceCoordinator>,
    current: Arc<CurrentDeviceCell>,
    hardware: Arc<dyn AudioHardware>,
    next_subscriber: Arc<AtomicU64>,
}

impl CoordinatorHandle {
    /// Snapshot of the current output device. The device may be removed at
    /// any moment, so check `exists()` before acting on it.
    pub fn current_output_device(&self) -> Option<AudioDevice> {
        self.current
            .load()
            .map(|id| AudioDevice::new(id, Arc::clone(&self.hardware)))
    }

    pub fn submit<F>(&self, task: F) -> Result<(), CoordinatorError>
    where
        F: FnOnce(&mut DeviceCoordinator) + Send + 'static,
    {
        if self.queue.submit(task) {
            Ok(())
        } else {
            Err(CoordinatorError::Shutdown)
        }
    }

    pub fn on_output_device_changed<F>(&self, subscriber: F) -> Result<SubscriberId, CoordinatorError>
    where
        F: FnMut(Option<&AudioDevice>, &AudioDevice) -> anyhow::Result<()> + Send + 'static,
    {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        let subscriber: OutputDeviceSubscriber = Box::new(subscriber);
        self.submit(move |coordinator| coordinator.subscribers.push((id, subscriber)))?;
        Ok(id)
    }

    pub fn remove_subscriber(&self, id: SubscriberId) -> Result<(), CoordinatorError> {
        self.submit(move |coordinator| {
            coordinator.remove_subscriber(id);
        })
    }

    pub fn reconcile(&self, trigger: Trigger) -> Result<(), CoordinatorError> {
        self.submit(move |coordinator| {
            let result = coordinator.reconcile(trigger);
            coordinator.record_fatal(result);
        })
    }

    /// Queue an explicit user choice of output device, by UID.
    pub fn choose_output_device(&self, uid: String) -> Result<(), CoordinatorError> {
        self.submit(move |coordinator| {
            let result = coordinator.choose_output_device(&uid);
            coordinator.record_fatal(result);
        })
    }

    pub fn set_preferences(&self, record: PreferenceRecord) -> Result<(), CoordinatorError> {
        self.submit(move |coordinator| {
            let result = coordinator.set_preferences(record);
            coordinator.record_fatal(result);
        })
    }
}

/// Owns the notion of "the current output device".
///
/// The coordinator is the single owner of its serialization point: every
/// platform notification and every queued request runs against `&mut self`,
/// one at a time, through [`process_pending`](Self::process_pending) or
/// [`run`](Self::run).
pub struct DeviceCoordinator {
    hardware: Arc<dyn AudioHardware>,
    virtual_provider: Arc<dyn VirtualDeviceProvider>,
    preference_store: Arc<dyn PreferenceStore>,
    control_sync: ControlSync,
    registry: PropertyListenerRegistry<DeviceCoordinator>,
    queue: SerialQueue<DeviceCoordinator>,
    receiver: mpsc::UnboundedReceiver<Task<DeviceCoordinator>>,
    current: Option<AudioDevice>,
    current_cell: Arc<CurrentDeviceCell>,
    preference: PreferenceRecord,
    // Only used to tell a connection apart from other device list changes.
    known_devices: Vec<DeviceId>,
    original_default: Option<DeviceId>,
    initialized: bool,
    routing: bool,
    subscribers: Vec<(SubscriberId, OutputDeviceSubscriber)>,
    next_subscriber: Arc<AtomicU64>,
    fatal: Option<CoordinatorError>,
}

impl DeviceCoordinator {
    /// Create a coordinator. The preference record is read once, here.
    pub fn new(
        hardware: Arc<dyn AudioHardware>,
        virtual_provider: Arc<dyn VirtualDeviceProvider>,
        preference_store: Arc<dyn PreferenceStore>,
    ) -> Self {
        let (queue, receiver) = SerialQueue::new();
        let preference = preference_store.load().unwrap_or_else(|e| {
            warn!("Failed to read output device preference, using defaults: {}", e);
            PreferenceRecord::default()
        });
        debug!("Loaded output device preference: {:?}", preference);

        Self {
            control_sync: ControlSync::new(Arc::clone(&virtual_provider)),
            registry: PropertyListenerRegistry::new(queue.clone()),
            hardware,
            virtual_provider,
            preference_store,
            queue,
            receiver,
            current: None,
            current_cell: Arc::new(CurrentDeviceCell::default()),
            preference,
            known_devices: Vec::new(),
            original_default: None,
            initialized: false,
            routing: false,
            subscribers: Vec::new(),
            next_subscriber: Arc::new(AtomicU64::new(1)),
            fatal: None,
        }
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            queue: self.queue.clone(),
            current: Arc::clone(&self.current_cell),
            hardware: Arc::clone(&self.hardware),
            next_subscriber: Arc::clone(&self.next_subscriber),
        }
    }

    pub fn virtual_device(&self) -> &AudioDevice {
        self.control_sync.virtual_device()
    }

    pub fn preference(&self) -> &PreferenceRecord {
        &self.preference
    }

    /// The system default output device from before this process took over.
    pub fn original_default(&self) -> Option<DeviceId> {
        self.original_default
    }

    pub fn registry(&self) -> &PropertyListenerRegistry<DeviceCoordinator> {
        &self.registry
    }

    /// Listen for device list and default output changes, and for changes to
    /// the virtual device's controls.
    pub fn start_listening(&mut self) -> Result<(), DeviceError> {
        info!("Registering device list and virtual device listeners");

        self.known_devices = self.hardware.device_ids().unwrap_or_else(|status| {
            warn!("Failed to read initial device list: {}", status);
            Vec::new()
        });

        let system = AudioDevice::system(Arc::clone(&self.hardware));
        self.registry
            .subscribe(&system, PropertyAddress::device_list(), |c| {
                c.handle_device_list_change()
            })?;
        self.registry
            .subscribe(&system, PropertyAddress::default_output_device(), |c| {
                c.handle_default_output_change()
            })?;

        let virtual_device = self.virtual_device().clone();
        for address in OUTPUT_CONTROLS {
            self.registry.subscribe(&virtual_device, address, |c| {
                c.handle_virtual_controls_change()
            })?;
        }

        Ok(())
    }

    /// Pick the first output device. Called once, after permission was granted.
    ///
    /// Calling it again is a no-op that returns the current device.
    pub fn choose_initial_output_device(&mut self) -> Result<AudioDevice, CoordinatorError> {
        if self.initialized {
            debug!("Initial output device already chosen");
            return self
                .current
                .clone()
                .ok_or(CoordinatorError::NoOutputDeviceAvailable);
        }

        info!("Choosing initial output device");

        let virtual_id = self.virtual_device().id();
        self.original_default = match self.hardware.default_output_device() {
            Ok(Some(id)) if id != virtual_id => Some(id),
            Ok(_) => None,
            Err(status) => {
                warn!("Failed to read the system default output device: {}", status);
                None
            }
        };
        if self.known_devices.is_empty() {
            self.known_devices = self.hardware.device_ids().unwrap_or_default();
        }

        let candidates = self
            .candidates()
            .ok_or(CoordinatorError::NoOutputDeviceAvailable)?;
        let selection = select_output_device(&self.selection_input(&candidates, Trigger::Startup))
            .inspect_err(|e| error!("Could not choose an initial output device: {}", e))?;

        let device = AudioDevice::new(selection.device, Arc::clone(&self.hardware));
        self.switch_to(device.clone(), Trigger::Startup);
        self.initialized = true;
        Ok(device)
    }

    pub fn current_output_device(&self) -> Option<AudioDevice> {
        self.current.clone()
    }

    pub fn on_output_device_changed<F>(&mut self, subscriber: F) -> SubscriberId
    where
        F: FnMut(Option<&AudioDevice>, &AudioDevice) -> anyhow::Result<()> + Send + 'static,
    {
        let id = SubscriberId(self.next_subscriber.fetch_add(1, Ordering::Relaxed));
        self.subscribers.push((id, Box::new(subscriber)));
        id
    }

    pub fn remove_subscriber(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(existing, _)| *existing != id);
        before != self.subscribers.len()
    }

    /// Re-run selection and switch if the answer differs from the current device.
    ///
    /// Returns whether the output device changed.
    pub fn reconcile(&mut self, trigger: Trigger) -> Result<bool, CoordinatorError> {
        if !self.initialized {
            debug!("Ignoring {} before the initial output device is chosen", trigger);
            return Ok(false);
        }

        let Some(candidates) = self.candidates() else {
            warn!("Skipping reconciliation for {}, device list unavailable", trigger);
            return Ok(false);
        };

        let selection = select_output_device(&self.selection_input(&candidates, trigger));
        match selection {
            Ok(selection) => {
                if self.current.as_ref().map(AudioDevice::id) == Some(selection.device) {
                    debug!("Output device unchanged after {}", trigger);
                    return Ok(false);
                }
                let device = AudioDevice::new(selection.device, Arc::clone(&self.hardware));
                self.switch_to(device, trigger);
                Ok(true)
            }
            Err(e) => {
                error!("No output device left after {}: {}", trigger, e);
                self.clear_current();
                Err(e)
            }
        }
    }

    /// The user picked a device: remember it as the explicit preference and reconcile.
    pub fn choose_output_device(&mut self, uid: &str) -> Result<bool, CoordinatorError> {
        info!("User chose output device {}", uid);
        self.preference.preferred_output_uid = Some(uid.to_string());
        if let Err(e) = self.preference_store.save(&self.preference) {
            warn!("Failed to persist output device preference: {}", e);
        }
        self.reconcile(Trigger::UserChoice)
    }

    /// Replace the preference record, for example after it was edited externally.
    pub fn set_preferences(&mut self, record: PreferenceRecord) -> Result<bool, CoordinatorError> {
        info!("Output device preference updated: {:?}", record);
        self.preference = record;
        self.reconcile(Trigger::PreferenceChanged)
    }

    /// Make the virtual device the system default, so all audio passes through it.
    pub fn route_through_virtual_device(&mut self) -> Result<(), CoordinatorError> {
        info!("Setting the virtual device as the system default output");
        self.virtual_provider
            .set_as_default_output()
            .map_err(CoordinatorError::VirtualDevice)?;
        self.routing = true;
        Ok(())
    }

    pub fn is_routing(&self) -> bool {
        self.routing
    }

    /// Run every queued task. Stops at the first fatal error.
    pub fn process_pending(&mut self) -> Result<usize, CoordinatorError> {
        let mut processed = 0;
        while let Ok(task) = self.receiver.try_recv() {
            task(self);
            processed += 1;
            if let Some(e) = self.fatal.take() {
                return Err(e);
            }
        }
        Ok(processed)
    }

    /// Serve the serialization point until `shutdown` completes or a fatal error occurs.
    pub async fn run<S>(&mut self, shutdown: S) -> Result<(), CoordinatorError>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Coordinator event loop started");

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Coordinator event loop stopping");
                    return Ok(());
                }
                task = self.receiver.recv() => {
                    let Some(task) = task else {
                        return Ok(());
                    };
                    task(self);
                    if let Some(e) = self.fatal.take() {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Drop every listener and give the default output role back.
    pub fn shutdown(&mut self) {
        info!("Shutting down output device coordinator");
        self.routing = false;
        self.registry.unsubscribe_all();

        let original = self
            .original_default
            .map(|id| AudioDevice::new(id, Arc::clone(&self.hardware)))
            .filter(AudioDevice::exists);
        let restore = original.or_else(|| self.current.clone().filter(AudioDevice::exists));

        match restore {
            Some(device) => {
                info!("Restoring {} as the system default output", device);
                if let Err(e) = self.virtual_provider.unset_as_default_output(device.id()) {
                    warn!("Failed to restore the system default output device: {}", e);
                }
            }
            None => warn!("No device to restore as the system default output"),
        }
    }

    fn handle_device_list_change(&mut self) {
        let ids = match self.hardware.device_ids() {
            Ok(ids) => ids,
            Err(status) => {
                warn!("Failed to read device list after change notification: {}", status);
                return;
            }
        };

        let virtual_id = self.virtual_device().id();
        if !ids.contains(&virtual_id) {
            error!("The virtual device {} is no longer in the device list", virtual_id);
        }

        let connected = ids
            .iter()
            .copied()
            .filter(|id| !self.known_devices.contains(id) && *id != virtual_id)
            .find(|id| {
                AudioDevice::new(*id, Arc::clone(&self.hardware))
                    .supports_output()
                    .unwrap_or(false)
            });
        let removed = self
            .known_devices
            .iter()
            .filter(|id| !ids.contains(*id))
            .count();
        debug!(
            "Device list changed: {} devices, {} removed, connected output {:?}",
            ids.len(),
            removed,
            connected
        );
        self.known_devices = ids;

        let trigger = connected.map_or(Trigger::DeviceListChanged, Trigger::DeviceConnected);
        let result = self.reconcile(trigger);
        self.record_fatal(result);
    }

    /// While routing, someone else (usually the user, in the system sound
    /// settings) made a real device the default. Take it as their choice of
    /// output device and put the virtual device back in front of it.
    fn handle_default_output_change(&mut self) {
        if !self.routing {
            return;
        }

        let virtual_device = self.virtual_device().clone();
        let default = match self.hardware.default_output_device() {
            Ok(Some(id)) if id == virtual_device.id() => return,
            Ok(default) => default,
            Err(status) => {
                warn!("Failed to read default output device after change: {}", status);
                return;
            }
        };
        if !virtual_device.exists() {
            warn!("Default output moved off the virtual device, which is gone");
            return;
        }

        let chosen = default
            .map(|id| AudioDevice::new(id, Arc::clone(&self.hardware)))
            .filter(|device| device.supports_output().unwrap_or(false))
            .and_then(|device| device.uid().ok());
        if let Some(uid) = chosen {
            info!("System default output changed to {}, following it", uid);
            let result = self.choose_output_device(&uid);
            self.record_fatal(result);
        }

        if let Err(e) = self.virtual_provider.set_as_default_output() {
            error!("Failed to put the virtual device back as default output: {}", e);
        }
    }

    fn handle_virtual_controls_change(&mut self) {
        if let Some(output) = &self.current {
            self.control_sync.push_to_output(output);
        }
    }

    fn handle_output_controls_change(&mut self) {
        if let Some(output) = &self.current {
            self.control_sync.pull_from_output(output);
        }
    }

    fn record_fatal<T>(&mut self, result: Result<T, CoordinatorError>) {
        if let Err(e) = result {
            if self.fatal.is_none() {
                self.fatal = Some(e);
            }
        }
    }

    fn candidates(&self) -> Option<Vec<DeviceCandidate>> {
        let ids = match self.hardware.device_ids() {
            Ok(ids) => ids,
            Err(status) => {
                warn!("Failed to enumerate devices: {}", status);
                return None;
            }
        };

        let candidates = ids
            .into_iter()
            .map(|id| {
                let device = AudioDevice::new(id, Arc::clone(&self.hardware));
                let uid = device
                    .uid()
                    .inspect_err(|e| debug!("No UID for {}: {}", id, e))
                    .ok();
                let supports_output = device.supports_output().unwrap_or(false);
                DeviceCandidate::new(id, uid, supports_output)
            })
            .collect();
        Some(candidates)
    }

    fn selection_input<'a>(
        &'a self,
        candidates: &'a [DeviceCandidate],
        trigger: Trigger,
    ) -> SelectionInput<'a> {
        let virtual_id = self.virtual_device().id();
        let reported = self.hardware.default_output_device().unwrap_or_else(|status| {
            warn!("Failed to read the system default output device: {}", status);
            None
        });
        let system_default =
            effective_system_default(candidates, reported, self.original_default, virtual_id);

        SelectionInput {
            devices: candidates,
            preference: &self.preference,
            trigger,
            previous: self.current.as_ref().map(AudioDevice::id),
            system_default,
            virtual_device: virtual_id,
        }
    }

    fn switch_to(&mut self, device: AudioDevice, trigger: Trigger) {
        let old = self.current.clone();
        let old_id = old.as_ref().map(AudioDevice::id);
        info!(
            "Switching output device {} -> {} ({})",
            old.as_ref()
                .map_or_else(|| "none".to_string(), |d| d.id().to_string()),
            device,
            trigger
        );

        for address in OUTPUT_CONTROLS {
            if let Err(e) = self.registry.swap_device(old_id, &device, address, |c| {
                c.handle_output_controls_change()
            }) {
                if e.is_expected() {
                    info!("Not watching {} on {}: {}", address, device.id(), e);
                } else {
                    warn!("Failed to watch {} on {}: {}", address, device.id(), e);
                }
            }
        }

        self.control_sync.attach(&device);

        self.current = Some(device.clone());
        self.current_cell.store(Some(device.id()));

        self.notify_subscribers(old.as_ref(), &device);
    }

    fn clear_current(&mut self) {
        if let Some(old) = self.current.take() {
            for address in OUTPUT_CONTROLS {
                self.registry.unsubscribe(old.id(), address);
            }
        }
        self.current_cell.store(None);
    }

    fn notify_subscribers(&mut self, old: Option<&AudioDevice>, new: &AudioDevice) {
        debug!("Notifying {} output device subscribers", self.subscribers.len());
        for (id, subscriber) in self.subscribers.iter_mut() {
            match catch_unwind(AssertUnwindSafe(|| subscriber(old, new))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Output device subscriber {:?} failed: {}", id, e),
                Err(_) => error!("Output device subscriber {:?} panicked", id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{MockAudioHardware, MockDevice, MockPreferenceStore, MockVirtualDevice};

    fn coordinator(hardware: &Arc<MockAudioHardware>) -> DeviceCoordinator {
        hardware.add_device(MockDevice::output(2, "VirtualDevice", "Virtual").with_volume(0.5));
        let provider = Arc::new(MockVirtualDevice::new(Arc::clone(hardware), DeviceId(2)));
        let store = Arc::new(MockPreferenceStore::new(PreferenceRecord::default()));
        DeviceCoordinator::new(hardware.clone(), provider, store)
    }

    #[test]
    fn test_snapshot_cell_roundtrip() {
        let cell = CurrentDeviceCell::default();
        assert_eq!(cell.load(), None);
        cell.store(Some(DeviceId(42)));
        assert_eq!(cell.load(), Some(DeviceId(42)));
        cell.store(None);
        assert_eq!(cell.load(), None);
    }

    #[test]
    fn test_reconcile_before_initial_choice_is_ignored() {
        let hardware = Arc::new(MockAudioHardware::new());
        let mut coordinator = coordinator(&hardware);
        hardware.add_device(MockDevice::output(10, "speakers", "Speakers"));

        assert_eq!(coordinator.reconcile(Trigger::DeviceListChanged), Ok(false));
        assert!(coordinator.current_output_device().is_none());
    }

    #[test]
    fn test_handle_reads_snapshot() {
        let hardware = Arc::new(MockAudioHardware::new());
        let mut coordinator = coordinator(&hardware);
        hardware.add_device(MockDevice::output(10, "speakers", "Speakers"));
        hardware.set_mock_default_output(Some(DeviceId(10)));
        let handle = coordinator.handle();

        assert!(handle.current_output_device().is_none());
        coordinator.choose_initial_output_device().unwrap();
        assert_eq!(
            handle.current_output_device().map(|d| d.id()),
            Some(DeviceId(10))
        );
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_delivery() {
        let hardware = Arc::new(MockAudioHardware::new());
        let mut coordinator = coordinator(&hardware);
        hardware.add_device(MockDevice::output(10, "speakers", "Speakers"));
        hardware.set_mock_default_output(Some(DeviceId(10)));

        let delivered = Arc::new(AtomicU32::new(0));
        coordinator.on_output_device_changed(|_, _| panic!("subscriber bug"));
        coordinator.on_output_device_changed(|_, _| Err(anyhow::anyhow!("subscriber error")));
        let counter = Arc::clone(&delivered);
        coordinator.on_output_device_changed(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        coordinator.choose_initial_output_device().unwrap();
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }
}
