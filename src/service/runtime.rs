use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::signals::SignalType;
use crate::audio::{AudioDevice, CoordinatorHandle, DeviceCoordinator};
use crate::error::CoordinatorError;
use crate::system::{
    AudioHardware, PermissionGate, PermissionStatus, PreferenceStore, VirtualDeviceProvider,
};

/// Routes all system audio through the virtual device for as long as it runs.
///
/// Lifecycle: [`start`](Self::start), then [`run`](Self::run) until a
/// shutdown signal or a fatal error, then [`shutdown`](Self::shutdown).
pub struct OutputRoutingService {
    coordinator: DeviceCoordinator,
    permission_gate: Arc<dyn PermissionGate>,
    preference_store: Arc<dyn PreferenceStore>,
}

impl OutputRoutingService {
    pub fn new(
        hardware: Arc<dyn AudioHardware>,
        virtual_provider: Arc<dyn VirtualDeviceProvider>,
        permission_gate: Arc<dyn PermissionGate>,
        preference_store: Arc<dyn PreferenceStore>,
    ) -> Self {
        Self {
            coordinator: DeviceCoordinator::new(
                hardware,
                virtual_provider,
                Arc::clone(&preference_store),
            ),
            permission_gate,
            preference_store,
        }
    }

    pub fn coordinator(&self) -> &DeviceCoordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut DeviceCoordinator {
        &mut self.coordinator
    }

    pub fn handle(&self) -> CoordinatorHandle {
        self.coordinator.handle()
    }

    /// Wait for permission, choose the first output device and take over the
    /// system default output.
    pub async fn start(&mut self) -> Result<AudioDevice, CoordinatorError> {
        info!("Starting output routing service");

        let status = self
            .permission_gate
            .request_access()
            .await
            .unwrap_or_else(|_| {
                warn!("Permission gate went away without answering");
                PermissionStatus::Denied
            });
        if status == PermissionStatus::Denied {
            error!("Audio access was denied");
            return Err(CoordinatorError::PermissionDenied);
        }

        self.coordinator.start_listening().map_err(|e| {
            CoordinatorError::VirtualDevice(format!("Failed to register listeners: {}", e))
        })?;

        let device = self.coordinator.choose_initial_output_device()?;
        self.coordinator.route_through_virtual_device()?;

        info!("Output routing service started, output device is {}", device);
        Ok(device)
    }

    /// Serve the coordinator until a shutdown signal arrives, the signal
    /// channel closes, or a fatal error occurs.
    pub async fn run(
        &mut self,
        mut signals: mpsc::UnboundedReceiver<SignalType>,
    ) -> Result<(), CoordinatorError> {
        let handle = self.coordinator.handle();
        let store = Arc::clone(&self.preference_store);

        let shutdown = async move {
            while let Some(signal) = signals.recv().await {
                match signal {
                    SignalType::Shutdown => break,
                    SignalType::Reload => reload_preferences(store.as_ref(), &handle),
                }
            }
        };

        self.coordinator.run(shutdown).await
    }

    /// Remove every listener and hand the default output role back.
    pub fn shutdown(&mut self) {
        self.coordinator.shutdown();
        info!("Output routing service stopped");
    }
}

fn reload_preferences(store: &dyn PreferenceStore, handle: &CoordinatorHandle) {
    match store.load() {
        Ok(record) => {
            if let Err(e) = handle.set_preferences(record) {
                warn!("Could not apply reloaded preferences: {}", e);
            }
        }
        Err(e) => warn!("Failed to reload output device preference: {}", e),
    }
}
