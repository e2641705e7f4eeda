use crate::controller::button_map::PhysicalControl;
use crate::controller::controller_hub::{ControllerId, PlatformEvent};
use crate::controller::input_mapper::ControllerSample;
use chrono::Local;
use gilrs::{Axis, Button, Event, EventType, Gamepad, GamepadId, Gilrs};
use statum::{machine, state};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// Collector settings
#[derive(Clone, Debug)]
pub struct CollectorSettings {
    pub poll_interval_ms: u64,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 4,
        }
    }
}

// Collector errors
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("Failed to initialize collector: {0}")]
    InitializationError(String),

    #[error("Failed to send event: {0}")]
    EventSendError(String),

    #[error("Failed to spawn collector thread: {0}")]
    ThreadError(String),
}

#[state]
#[derive(Debug, Clone)]
pub enum CollectionState {
    Initializing,
    Collecting,
}

/// Gilrs-backed adapter that turns gamepad events into [`PlatformEvent`]s.
///
/// Every button or left-stick change produces a full [`ControllerSample`] read
/// from gilrs' cached gamepad state, so the hub always sees a complete snapshot.
#[machine]
pub struct EventCollector<S: CollectionState> {
    gilrs: Gilrs,
    settings: CollectorSettings,
    event_sender: mpsc::Sender<PlatformEvent>,
}

impl<S: CollectionState> EventCollector<S> {
    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }
}

impl EventCollector<Initializing> {
    pub fn create(
        settings: Option<CollectorSettings>,
        event_sender: mpsc::Sender<PlatformEvent>,
    ) -> Result<Self, CollectorError> {
        let settings = settings.unwrap_or_default();
        debug!("Creating Event Collector with settings: {:?}", settings);

        info!("Initializing gilrs controller interface");
        let gilrs = match Gilrs::new() {
            Ok(g) => g,
            Err(e) => {
                error!("Failed to initialize gilrs: {}", e);
                return Err(CollectorError::InitializationError(e.to_string()));
            }
        };

        Ok(Self::new(gilrs, settings, event_sender))
    }

    /// Announces already connected gamepads and switches to collecting.
    pub fn initialize(self) -> Result<EventCollector<Collecting>, CollectorError> {
        let gamepads: Vec<(GamepadId, Gamepad<'_>)> = self.gilrs.gamepads().collect();
        if gamepads.is_empty() {
            warn!("No gamepad connected, waiting for connections");
        } else {
            info!("Found {} gamepads", gamepads.len());
        }

        let mut initial = Vec::with_capacity(gamepads.len());
        for (id, gamepad) in &gamepads {
            info!("  ID: {}, Name: {}", id, gamepad.name());
            initial.push(PlatformEvent::Connected {
                id: ControllerId(usize::from(*id)),
                name: gamepad.name().to_string(),
                timestamp: Local::now(),
            });
        }
        drop(gamepads);

        for event in initial {
            self.forward(event)?;
        }

        Ok(self.transition())
    }

    fn forward(&self, event: PlatformEvent) -> Result<(), CollectorError> {
        self.event_sender
            .blocking_send(event)
            .map_err(|e| CollectorError::EventSendError(e.to_string()))
    }
}

impl EventCollector<Collecting> {
    /// Drains pending gilrs events. Returns the number of forwarded events.
    pub fn collect_pending(&mut self) -> Result<usize, CollectorError> {
        let mut forwarded = 0;
        while let Some(Event { id, event, .. }) = self.gilrs.next_event() {
            if let Some(platform_event) = self.convert_gilrs_event(id, event) {
                self.event_sender
                    .blocking_send(platform_event)
                    .map_err(|e| CollectorError::EventSendError(e.to_string()))?;
                forwarded += 1;
            }
        }
        Ok(forwarded)
    }

    /// Polls until `cancel` fires or the receiving side goes away.
    pub fn run_collection_loop(&mut self, cancel: &CancellationToken) -> Result<(), CollectorError> {
        info!("Starting Event Collector loop");
        let pause = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        poll_loop(cancel, pause, || self.collect_pending())
    }

    fn convert_gilrs_event(&self, id: GamepadId, event: EventType) -> Option<PlatformEvent> {
        let controller = ControllerId(usize::from(id));
        let timestamp = Local::now();

        match event {
            EventType::Connected => {
                let name = self.gilrs.gamepad(id).name().to_string();
                Some(PlatformEvent::Connected {
                    id: controller,
                    name,
                    timestamp,
                })
            }
            EventType::Disconnected => Some(PlatformEvent::Disconnected {
                id: controller,
                timestamp,
            }),
            EventType::ButtonPressed(button, _) | EventType::ButtonReleased(button, _) => {
                map_button(button)?;
                Some(self.sample_event(id, controller))
            }
            EventType::ButtonChanged(button, _, _) => {
                // Analog triggers report through ButtonChanged before crossing
                // their press threshold; only pressed/released matter here.
                debug!("Button value change ignored: {:?}", button);
                None
            }
            EventType::AxisChanged(Axis::LeftStickX | Axis::LeftStickY, _, _) => {
                Some(self.sample_event(id, controller))
            }
            _ => {
                debug!("Unhandled event type: {:?}", event);
                None
            }
        }
    }

    fn sample_event(&self, id: GamepadId, controller: ControllerId) -> PlatformEvent {
        let gamepad = self.gilrs.gamepad(id);
        let mut sample = ControllerSample::new()
            .with_left_stick(gamepad.value(Axis::LeftStickX), gamepad.value(Axis::LeftStickY));
        for button in TRACKED_BUTTONS {
            if gamepad.is_pressed(button) {
                if let Some(control) = map_button(button) {
                    sample = sample.with_pressed(control);
                }
            }
        }
        PlatformEvent::Sample {
            id: controller,
            sample,
            timestamp: Local::now(),
        }
    }
}

fn poll_loop(
    cancel: &CancellationToken,
    pause: Duration,
    mut poll: impl FnMut() -> Result<usize, CollectorError>,
) -> Result<(), CollectorError> {
    while !cancel.is_cancelled() {
        match poll() {
            Ok(_) => {}
            Err(CollectorError::EventSendError(e)) => {
                info!("Event receiver closed ({}), stopping collector", e);
                return Ok(());
            }
            Err(e) => error!("Error collecting event: {}", e),
        }
        std::thread::sleep(pause);
    }
    info!("Event Collector cancelled");
    Ok(())
}

const TRACKED_BUTTONS: [Button; 12] = [
    Button::South,
    Button::East,
    Button::Select,
    Button::Start,
    Button::DPadRight,
    Button::DPadLeft,
    Button::DPadUp,
    Button::DPadDown,
    Button::RightTrigger,
    Button::RightTrigger2,
    Button::LeftTrigger,
    Button::LeftTrigger2,
];

// gilrs names the shoulder buttons Left/RightTrigger and the analog triggers
// Left/RightTrigger2.
fn map_button(button: Button) -> Option<PhysicalControl> {
    match button {
        Button::South => Some(PhysicalControl::ButtonA),
        Button::East => Some(PhysicalControl::ButtonB),
        Button::Select => Some(PhysicalControl::Options),
        Button::Start => Some(PhysicalControl::Menu),
        Button::DPadRight => Some(PhysicalControl::DPadRight),
        Button::DPadLeft => Some(PhysicalControl::DPadLeft),
        Button::DPadUp => Some(PhysicalControl::DPadUp),
        Button::DPadDown => Some(PhysicalControl::DPadDown),
        Button::RightTrigger => Some(PhysicalControl::RightShoulder),
        Button::RightTrigger2 => Some(PhysicalControl::RightTrigger),
        Button::LeftTrigger => Some(PhysicalControl::LeftShoulder),
        Button::LeftTrigger2 => Some(PhysicalControl::LeftTrigger),
        _ => None,
    }
}

/// Runs the collector on its own OS thread.
///
/// gilrs polls synchronously, so the collector lives outside the tokio
/// scheduler and hands events over with `blocking_send`.
pub struct CollectorHandle {
    cancel: CancellationToken,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CollectorHandle {
    pub fn spawn(
        settings: Option<CollectorSettings>,
        event_sender: mpsc::Sender<PlatformEvent>,
        cancel: CancellationToken,
    ) -> Result<Self, CollectorError> {
        info!("Spawning Event Collector with settings: {:?}", settings);
        let (init_tx, init_rx) = std::sync::mpsc::sync_channel(1);
        let thread_cancel = cancel.clone();

        let thread = std::thread::Builder::new()
            .name("gamepad-collector".into())
            .spawn(move || {
                let collector = match EventCollector::create(settings, event_sender) {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                        return;
                    }
                };
                match collector.initialize() {
                    Ok(mut collecting) => {
                        let _ = init_tx.send(Ok(()));
                        if let Err(e) = collecting.run_collection_loop(&thread_cancel) {
                            error!("Collector thread terminated with error: {}", e);
                        }
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| CollectorError::ThreadError(e.to_string()))?;

        match init_rx.recv() {
            Ok(Ok(())) => {
                info!("Event Collector successfully started");
                Ok(Self {
                    cancel,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(CollectorError::ThreadError(e.to_string())),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancels the loop and waits for the thread. Blocks for up to one poll
    /// interval plus one gilrs drain.
    pub fn join(&mut self) -> Result<(), CollectorError> {
        self.cancel.cancel();
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread
            .join()
            .map_err(|_| CollectorError::ThreadError("collector thread panicked".into()))?;
        debug!("Event Collector thread joined");
        Ok(())
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracked_buttons_all_map() {
        for button in TRACKED_BUTTONS {
            assert!(map_button(button).is_some(), "{:?} has no mapping", button);
        }
    }

    #[test]
    fn face_buttons_follow_positions() {
        assert_eq!(map_button(Button::South), Some(PhysicalControl::ButtonA));
        assert_eq!(map_button(Button::East), Some(PhysicalControl::ButtonB));
        assert_eq!(map_button(Button::North), None);
        assert_eq!(map_button(Button::Mode), None);
    }

    #[test]
    fn poll_loop_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let remote = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            remote.cancel();
        });

        let mut polls = 0;
        let result = poll_loop(&cancel, Duration::from_millis(1), || {
            polls += 1;
            Ok(0)
        });
        canceller.join().unwrap();

        assert!(result.is_ok());
        assert!(polls > 0);
    }

    #[test]
    fn poll_loop_stops_when_the_receiver_is_gone() {
        let cancel = CancellationToken::new();
        let mut polls = 0;
        let result = poll_loop(&cancel, Duration::from_millis(1), || {
            polls += 1;
            if polls == 3 {
                Err(CollectorError::EventSendError("channel closed".into()))
            } else {
                Ok(1)
            }
        });

        assert!(result.is_ok());
        assert_eq!(polls, 3);
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn poll_loop_keeps_going_after_other_errors() {
        let cancel = CancellationToken::new();
        let mut polls = 0;
        poll_loop(&cancel, Duration::from_millis(1), || {
            polls += 1;
            if polls == 5 {
                cancel.cancel();
            }
            Err(CollectorError::InitializationError("device busy".into()))
        })
        .unwrap();
        assert_eq!(polls, 5);
    }
}
