//! Controller registry and aggregate attach state.
//!
//! The hub owns one [`InputMapper`] per connected controller. All mappers
//! forward into a shared [`KeyAggregator`], which keeps a per-bit hold count so
//! a key released on one pad stays held while another pad still holds it.

use crate::controller::button_map::{describe_mask, KeyBitmask};
use crate::controller::input_mapper::{ControllerSample, EmulatorCore, InputMapper, KeyDelta};
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Identity of a physical controller as assigned by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ControllerId(pub usize);

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pad#{}", self.0)
    }
}

/// Events delivered by the host platform adapter.
#[derive(Debug, Clone)]
pub enum PlatformEvent {
    Connected {
        id: ControllerId,
        name: String,
        timestamp: DateTime<Local>,
    },
    Disconnected {
        id: ControllerId,
        timestamp: DateTime<Local>,
    },
    Sample {
        id: ControllerId,
        sample: ControllerSample,
        timestamp: DateTime<Local>,
    },
}

/// Events published by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    ControllerConnected { id: ControllerId, name: String },
    ControllerDisconnected { id: ControllerId },
    /// Transition of the aggregate key state as seen by the emulator core.
    KeysChanged { delta: KeyDelta },
}

/// Reference-counting adapter between the mappers and the emulator core.
///
/// Every transition is published as [`HubEvent::KeysChanged`] on an unbounded
/// channel; peers mirror these deltas, so none may be skipped.
pub struct KeyAggregator {
    core: Arc<dyn EmulatorCore>,
    counts: Mutex<[u16; 32]>,
    events: Option<mpsc::UnboundedSender<HubEvent>>,
}

impl KeyAggregator {
    pub fn new(core: Arc<dyn EmulatorCore>, events: Option<mpsc::UnboundedSender<HubEvent>>) -> Self {
        Self {
            core,
            counts: Mutex::new([0; 32]),
            events,
        }
    }

    /// Bits currently held by at least one controller.
    pub fn held(&self) -> KeyBitmask {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .fold(0, |mask, (bit, _)| mask | (1 << bit))
    }

    fn publish(&self, delta: KeyDelta) {
        if let Some(events) = &self.events {
            if events.send(HubEvent::KeysChanged { delta }).is_err() {
                debug!("Hub event receiver dropped, key change not published");
            }
        }
    }
}

impl EmulatorCore for KeyAggregator {
    fn add_keys(&self, mask: KeyBitmask) {
        let rising = {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            let mut rising = 0;
            for bit in 0..32 {
                if mask & (1 << bit) != 0 {
                    counts[bit] = counts[bit].saturating_add(1);
                    if counts[bit] == 1 {
                        rising |= 1 << bit;
                    }
                }
            }
            rising
        };
        if rising != 0 {
            self.core.add_keys(rising);
            self.publish(KeyDelta {
                add: rising,
                clear: 0,
            });
        }
    }

    fn clear_keys(&self, mask: KeyBitmask) {
        let falling = {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            let mut falling = 0;
            for bit in 0..32 {
                if mask & (1 << bit) != 0 && counts[bit] > 0 {
                    counts[bit] -= 1;
                    if counts[bit] == 0 {
                        falling |= 1 << bit;
                    }
                }
            }
            falling
        };
        if falling != 0 {
            self.core.clear_keys(falling);
            self.publish(KeyDelta {
                add: 0,
                clear: falling,
            });
        }
    }
}

/// One live controller.
pub struct ControllerSession {
    pub name: String,
    pub connected_at: DateTime<Local>,
    mapper: InputMapper,
}

pub struct ControllerHub {
    aggregator: Arc<KeyAggregator>,
    sessions: HashMap<ControllerId, ControllerSession>,
    attached_tx: watch::Sender<bool>,
    events: Option<mpsc::UnboundedSender<HubEvent>>,
}

impl ControllerHub {
    pub fn new(core: Arc<dyn EmulatorCore>, events: Option<mpsc::UnboundedSender<HubEvent>>) -> Self {
        let (attached_tx, _) = watch::channel(false);
        Self {
            aggregator: Arc::new(KeyAggregator::new(core, events.clone())),
            sessions: HashMap::new(),
            attached_tx,
            events,
        }
    }

    /// Signal that is `true` while at least one controller is connected.
    pub fn attached(&self) -> watch::Receiver<bool> {
        self.attached_tx.subscribe()
    }

    pub fn has_controller(&self) -> bool {
        !self.sessions.is_empty()
    }

    pub fn controller_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn held_keys(&self) -> KeyBitmask {
        self.aggregator.held()
    }

    pub fn connect(&mut self, id: ControllerId, name: String) {
        if self.sessions.contains_key(&id) {
            debug!("Controller {} already registered, keeping session", id);
            return;
        }
        info!("Controller connected: {} ({})", id, name);
        let mapper = InputMapper::new(self.aggregator.clone());
        self.sessions.insert(
            id,
            ControllerSession {
                name: name.clone(),
                connected_at: Local::now(),
                mapper,
            },
        );
        self.refresh_attached();
        self.emit(HubEvent::ControllerConnected { id, name });
    }

    pub fn disconnect(&mut self, id: ControllerId) {
        let Some(mut session) = self.sessions.remove(&id) else {
            debug!("Disconnect for unknown controller {}, ignoring", id);
            return;
        };
        let released = session.mapper.release_all();
        info!(
            "Controller disconnected: {} ({}), released {}",
            id,
            session.name,
            describe_mask(released.clear)
        );
        self.refresh_attached();
        self.emit(HubEvent::ControllerDisconnected { id });
    }

    /// Feeds a sample to the controller's mapper. Samples from controllers that
    /// never connected are dropped.
    pub fn apply_sample(&mut self, id: ControllerId, sample: &ControllerSample) -> Option<KeyDelta> {
        match self.sessions.get_mut(&id) {
            Some(session) => Some(session.mapper.apply(sample)),
            None => {
                debug!("Sample from unregistered controller {}, ignoring", id);
                None
            }
        }
    }

    pub fn handle_event(&mut self, event: PlatformEvent) {
        match event {
            PlatformEvent::Connected { id, name, .. } => self.connect(id, name),
            PlatformEvent::Disconnected { id, .. } => self.disconnect(id),
            PlatformEvent::Sample { id, sample, .. } => {
                self.apply_sample(id, &sample);
            }
        }
    }

    /// Processes platform events until the channel closes or `cancel` fires.
    pub async fn run(
        mut self,
        mut platform_events: mpsc::Receiver<PlatformEvent>,
        cancel: CancellationToken,
    ) -> Self {
        info!("Controller hub running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Controller hub cancelled");
                    break;
                }
                event = platform_events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        info!("Platform event channel closed, stopping controller hub");
                        break;
                    }
                }
            }
        }
        self
    }

    fn refresh_attached(&self) {
        let attached = !self.sessions.is_empty();
        self.attached_tx.send_if_modified(|current| {
            if *current != attached {
                *current = attached;
                true
            } else {
                false
            }
        });
    }

    fn emit(&self, event: HubEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("Hub event receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::button_map::{EmulatorKey, PhysicalControl};
    use crate::controller::input_mapper::tests::{CoreCall, RecordingCore};

    fn hub() -> (Arc<RecordingCore>, ControllerHub, mpsc::UnboundedReceiver<HubEvent>) {
        let core = Arc::new(RecordingCore::default());
        let (tx, rx) = mpsc::unbounded_channel();
        (core.clone(), ControllerHub::new(core, Some(tx)), rx)
    }

    #[test]
    fn attached_follows_registry() {
        let (_core, mut hub, _rx) = hub();
        let attached = hub.attached();
        assert!(!*attached.borrow());

        hub.connect(ControllerId(1), "Pad One".into());
        hub.connect(ControllerId(2), "Pad Two".into());
        assert!(*attached.borrow());

        hub.disconnect(ControllerId(1));
        assert!(*attached.borrow());
        assert_eq!(hub.controller_count(), 1);

        hub.disconnect(ControllerId(2));
        assert!(!*attached.borrow());
        assert!(!hub.has_controller());
    }

    #[test]
    fn unknown_disconnect_is_a_noop() {
        let (core, mut hub, mut rx) = hub();
        hub.disconnect(ControllerId(9));
        assert!(!hub.has_controller());
        assert!(core.calls().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn key_stays_held_while_another_pad_holds_it() {
        let (core, mut hub, _rx) = hub();
        let a = ControllerSample::new().with_pressed(PhysicalControl::ButtonA);
        hub.connect(ControllerId(1), "one".into());
        hub.connect(ControllerId(2), "two".into());

        hub.apply_sample(ControllerId(1), &a);
        hub.apply_sample(ControllerId(2), &a);
        hub.apply_sample(ControllerId(1), &ControllerSample::new());
        assert_eq!(hub.held_keys(), EmulatorKey::A.mask());

        hub.apply_sample(ControllerId(2), &ControllerSample::new());
        assert_eq!(hub.held_keys(), 0);
        assert_eq!(
            core.calls(),
            vec![
                CoreCall::Add(EmulatorKey::A.mask()),
                CoreCall::Clear(EmulatorKey::A.mask())
            ]
        );
    }

    #[test]
    fn disconnect_releases_held_keys() {
        let (core, mut hub, _rx) = hub();
        hub.connect(ControllerId(3), "pad".into());
        hub.apply_sample(
            ControllerId(3),
            &ControllerSample::new().with_pressed(PhysicalControl::DPadUp),
        );
        hub.disconnect(ControllerId(3));
        assert_eq!(
            core.calls().last(),
            Some(&CoreCall::Clear(EmulatorKey::Up.mask()))
        );
    }

    #[test]
    fn samples_from_unknown_pads_are_dropped() {
        let (core, mut hub, _rx) = hub();
        let sample = ControllerSample::new().with_pressed(PhysicalControl::ButtonB);
        assert_eq!(hub.apply_sample(ControllerId(5), &sample), None);
        assert!(core.calls().is_empty());
    }

    #[test]
    fn events_are_published_in_order() {
        let (_core, mut hub, mut rx) = hub();
        hub.connect(ControllerId(1), "pad".into());
        hub.apply_sample(
            ControllerId(1),
            &ControllerSample::new().with_pressed(PhysicalControl::ButtonB),
        );
        hub.disconnect(ControllerId(1));

        let b = EmulatorKey::B.mask();
        assert_eq!(
            rx.try_recv().unwrap(),
            HubEvent::ControllerConnected {
                id: ControllerId(1),
                name: "pad".into()
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            HubEvent::KeysChanged {
                delta: KeyDelta { add: b, clear: 0 }
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            HubEvent::KeysChanged {
                delta: KeyDelta { add: 0, clear: b }
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            HubEvent::ControllerDisconnected { id: ControllerId(1) }
        );
    }

    #[test]
    fn key_changes_survive_a_slow_reader() {
        let (_core, mut hub, mut rx) = hub();
        hub.connect(ControllerId(1), "pad".into());
        let pressed = ControllerSample::new().with_pressed(PhysicalControl::ButtonA);
        for _ in 0..5000 {
            hub.apply_sample(ControllerId(1), &pressed);
            hub.apply_sample(ControllerId(1), &ControllerSample::new());
        }

        let a = EmulatorKey::A.mask();
        let mut held = 0;
        let mut changes = 0;
        while let Ok(event) = rx.try_recv() {
            if let HubEvent::KeysChanged { delta } = event {
                held = (held & !delta.clear) | delta.add;
                changes += 1;
            }
        }
        assert_eq!(changes, 10_000);
        assert_eq!(held & a, 0);
    }

    #[tokio::test]
    async fn run_consumes_platform_events() {
        let (core, hub, _rx) = hub();
        let attached = hub.attached();
        let (tx, platform_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(hub.run(platform_rx, cancel.clone()));

        tx.send(PlatformEvent::Connected {
            id: ControllerId(0),
            name: "pad".into(),
            timestamp: Local::now(),
        })
        .await
        .unwrap();
        tx.send(PlatformEvent::Sample {
            id: ControllerId(0),
            sample: ControllerSample::new().with_pressed(PhysicalControl::ButtonA),
            timestamp: Local::now(),
        })
        .await
        .unwrap();
        drop(tx);

        let hub = task.await.unwrap();
        assert!(*attached.borrow());
        assert_eq!(hub.held_keys(), EmulatorKey::A.mask());
        assert_eq!(core.calls(), vec![CoreCall::Add(EmulatorKey::A.mask())]);
    }
}
