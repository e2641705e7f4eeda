//! Controller Handle - unified API for gamepad input
//!
//! Wires the gilrs collector thread to the [`ControllerHub`] task and exposes
//! the attach signal to the rest of the application.
//!

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::controller_hub::{ControllerHub, HubEvent};
use super::event_collector::{CollectorError, CollectorHandle, CollectorSettings};
use super::input_mapper::EmulatorCore;

/// Configuration settings for the controller subsystem
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerSettings {
    /// Pause between gilrs polls in milliseconds
    pub poll_interval_ms: u64,

    /// Capacity of the collector → hub channel
    pub event_queue_len: usize,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 4,
            event_queue_len: 1000,
        }
    }
}

/// Errors that can occur during controller initialization or operation
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// Error from the event collection subsystem
    #[error("Collector error: {0}")]
    CollectorError(#[from] CollectorError),

    /// Hub task ended abnormally
    #[error("Hub task error: {0}")]
    HubError(String),
}

/// Handle for the running controller subsystem
///
/// ```text
/// gilrs thread ─[PlatformEvent]→ ControllerHub task ─[add/clear]→ EmulatorCore
///                                         └──────────[HubEvent]→ application
/// ```
pub struct ControllerHandle {
    attached: watch::Receiver<bool>,
    cancel: CancellationToken,
    hub_task: Option<JoinHandle<ControllerHub>>,
    collector: Option<CollectorHandle>,
}

impl ControllerHandle {
    /// Spawns the collector thread and the hub task.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::CollectorError`] when gilrs cannot be
    /// initialized on this host.
    pub fn spawn(
        settings: Option<ControllerSettings>,
        core: Arc<dyn EmulatorCore>,
        hub_events: mpsc::UnboundedSender<HubEvent>,
    ) -> Result<Self, ControllerError> {
        let settings = settings.unwrap_or_default();
        info!("Initializing controller system with settings: {:?}", settings);

        let (platform_tx, platform_rx) = mpsc::channel(settings.event_queue_len.max(1));
        debug!(
            "Created platform event channel with capacity {}",
            settings.event_queue_len
        );

        let hub = ControllerHub::new(core, Some(hub_events));
        let attached = hub.attached();
        let cancel = CancellationToken::new();
        let hub_task = tokio::spawn(hub.run(platform_rx, cancel.clone()));

        let collector_settings = CollectorSettings {
            poll_interval_ms: settings.poll_interval_ms,
        };
        let collector = match CollectorHandle::spawn(Some(collector_settings), platform_tx, cancel.clone()) {
            Ok(collector) => collector,
            Err(e) => {
                cancel.cancel();
                return Err(e.into());
            }
        };

        info!("Controller system initialized successfully");
        Ok(Self {
            attached,
            cancel,
            hub_task: Some(hub_task),
            collector: Some(collector),
        })
    }

    /// Whether at least one controller is connected. Decides if touch
    /// controls should be shown.
    pub fn has_controller(&self) -> bool {
        *self.attached.borrow()
    }

    pub fn subscribe_attached(&self) -> watch::Receiver<bool> {
        self.attached.clone()
    }

    /// Stops the hub task and joins the collector thread.
    pub async fn shutdown(&mut self) -> Result<(), ControllerError> {
        self.cancel.cancel();
        if let Some(mut collector) = self.collector.take() {
            tokio::task::spawn_blocking(move || collector.join())
                .await
                .map_err(|e| ControllerError::HubError(e.to_string()))??;
            debug!("Collector thread stopped");
        }
        if let Some(task) = self.hub_task.take() {
            match task.await {
                Ok(hub) => {
                    debug!("Hub stopped with {} controllers", hub.controller_count());
                }
                Err(e) => {
                    error!("Controller hub task panicked: {}", e);
                    return Err(ControllerError::HubError(e.to_string()));
                }
            }
        }
        Ok(())
    }
}
