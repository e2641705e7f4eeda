use crate::controller::{EmulatorCore, KeyAggregator, KeyBitmask, KeyDelta};
use super::connection::ConnectionId;
use super::frame_codec::{Frame, FrameKind};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Second virtual controller slot driven by a peer's input-delta frames.
///
/// Remote keys go to their own core and never mix with the local mask. Only
/// transitions that change the slot's held set are forwarded.
pub struct RemoteInputSlot {
    core: Arc<dyn EmulatorCore>,
    held: KeyBitmask,
}

impl RemoteInputSlot {
    pub fn new(core: Arc<dyn EmulatorCore>) -> Self {
        Self { core, held: 0 }
    }

    /// Applies an input-delta frame. Other kinds and malformed payloads are ignored.
    pub fn apply(&mut self, frame: &Frame) -> Option<KeyDelta> {
        if frame.kind != FrameKind::InputDelta {
            return None;
        }
        let Some(delta) = KeyDelta::from_bytes(&frame.payload) else {
            warn!(
                "Dropping input frame #{} with {} byte payload",
                frame.sequence,
                frame.payload.len()
            );
            return None;
        };

        let effective = KeyDelta {
            add: delta.add & !self.held,
            clear: delta.clear & self.held,
        };
        self.held = (self.held & !effective.clear) | effective.add;
        if effective.is_empty() {
            return None;
        }
        debug!(
            "Remote keys: add={:#06x} clear={:#06x}",
            effective.add, effective.clear
        );
        effective.forward_to(self.core.as_ref());
        Some(effective)
    }

    /// Releases everything the peer held, e.g. after it disconnected.
    pub fn release_all(&mut self) -> Option<KeyDelta> {
        if self.held == 0 {
            return None;
        }
        let delta = KeyDelta::between(self.held, 0);
        self.held = 0;
        delta.forward_to(self.core.as_ref());
        Some(delta)
    }

    pub fn held(&self) -> KeyBitmask {
        self.held
    }
}

/// Remote key state for every connected peer.
///
/// Each peer gets its own [`RemoteInputSlot`]. The slots share one
/// [`KeyAggregator`], so a key stays held on the remote core while any peer
/// still holds it, and losing a peer releases only what that peer held.
pub struct RemotePeers {
    aggregator: Arc<KeyAggregator>,
    slots: HashMap<ConnectionId, RemoteInputSlot>,
}

impl RemotePeers {
    pub fn new(core: Arc<dyn EmulatorCore>) -> Self {
        Self {
            aggregator: Arc::new(KeyAggregator::new(core, None)),
            slots: HashMap::new(),
        }
    }

    /// Applies an input frame received from `peer`.
    pub fn apply(&mut self, peer: ConnectionId, frame: &Frame) -> Option<KeyDelta> {
        let aggregator = self.aggregator.clone();
        self.slots
            .entry(peer)
            .or_insert_with(|| RemoteInputSlot::new(aggregator))
            .apply(frame)
    }

    /// Forgets `peer` and releases the keys it held.
    pub fn release(&mut self, peer: ConnectionId) -> Option<KeyDelta> {
        let mut slot = self.slots.remove(&peer)?;
        let released = slot.release_all();
        if let Some(delta) = released {
            info!("{} left holding {:#06x}, released", peer, delta.clear);
        }
        released
    }

    /// Bits held by at least one peer.
    pub fn held(&self) -> KeyBitmask {
        self.aggregator.held()
    }

    pub fn peer_count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::input_mapper::tests::{CoreCall, RecordingCore};

    fn input(sequence: u32, add: KeyBitmask, clear: KeyBitmask) -> Frame {
        Frame::new(
            sequence,
            FrameKind::InputDelta,
            KeyDelta { add, clear }.to_bytes(),
        )
    }

    #[test]
    fn applies_input_frames_to_its_own_core() {
        let core = Arc::new(RecordingCore::default());
        let mut slot = RemoteInputSlot::new(core.clone());

        assert_eq!(slot.apply(&input(0, 0b101, 0)), Some(KeyDelta { add: 0b101, clear: 0 }));
        // Already held bits are not re-added; unheld bits are not cleared.
        assert_eq!(slot.apply(&input(1, 0b001, 0b010)), None);
        assert_eq!(slot.apply(&input(2, 0b010, 0b100)), Some(KeyDelta { add: 0b010, clear: 0b100 }));
        assert_eq!(slot.held(), 0b011);

        assert_eq!(
            core.calls(),
            vec![
                CoreCall::Add(0b101),
                CoreCall::Clear(0b100),
                CoreCall::Add(0b010),
            ]
        );
    }

    #[test]
    fn ignores_other_kinds_and_bad_payloads() {
        let core = Arc::new(RecordingCore::default());
        let mut slot = RemoteInputSlot::new(core.clone());

        assert_eq!(slot.apply(&Frame::new(0, FrameKind::Control, vec![0; 8])), None);
        assert_eq!(slot.apply(&Frame::new(1, FrameKind::InputDelta, vec![1, 2])), None);
        assert!(core.calls().is_empty());
    }

    #[test]
    fn releases_everything_on_peer_loss() {
        let core = Arc::new(RecordingCore::default());
        let mut slot = RemoteInputSlot::new(core.clone());
        slot.apply(&input(0, 0x201, 0));

        assert_eq!(slot.release_all(), Some(KeyDelta { add: 0, clear: 0x201 }));
        assert_eq!(slot.release_all(), None);
        assert_eq!(core.calls().last(), Some(&CoreCall::Clear(0x201)));
    }

    #[test]
    fn peer_loss_releases_only_that_peers_keys() {
        let core = Arc::new(RecordingCore::default());
        let mut peers = RemotePeers::new(core.clone());
        let first = ConnectionId(1);
        let second = ConnectionId(2);

        peers.apply(first, &input(0, 0b01, 0));
        peers.apply(second, &input(0, 0b01, 0));
        peers.apply(second, &input(1, 0b10, 0b01));
        assert_eq!(peers.held(), 0b11);
        assert_eq!(peers.peer_count(), 2);

        // The first peer still holds bit 0.
        assert_eq!(peers.release(second), Some(KeyDelta { add: 0, clear: 0b10 }));
        assert_eq!(peers.held(), 0b01);
        assert_eq!(peers.release(second), None);

        assert_eq!(peers.release(first), Some(KeyDelta { add: 0, clear: 0b01 }));
        assert_eq!(peers.held(), 0);
        assert_eq!(peers.peer_count(), 0);

        assert_eq!(
            core.calls(),
            vec![
                CoreCall::Add(0b01),
                CoreCall::Add(0b10),
                CoreCall::Clear(0b10),
                CoreCall::Clear(0b01),
            ]
        );
    }
}
