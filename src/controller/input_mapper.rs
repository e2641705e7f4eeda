//! Per-controller conversion of raw samples into key deltas.
//!
//! ```text
//! ControllerSample ──► digitize (ButtonMap) ──► compare with previous ──► KeyDelta
//!                                                                          │
//!                                            EmulatorCore.clear_keys ◄─────┤
//!                                            EmulatorCore.add_keys   ◄─────┘
//! ```

use crate::controller::button_map::{ButtonMap, KeyBitmask, PhysicalControl};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Key input surface of the emulator core.
///
/// Bits follow [`KeyBitmask`]: `add_keys` marks the given bits held,
/// `clear_keys` marks them released. Both may be called from the hub task.
pub trait EmulatorCore: Send + Sync + 'static {
    fn add_keys(&self, mask: KeyBitmask);
    fn clear_keys(&self, mask: KeyBitmask);
}

/// Snapshot of one controller's state as reported by the host platform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControllerSample {
    pub pressed: BTreeSet<PhysicalControl>,
    pub left_stick_x: f32,
    pub left_stick_y: f32,
}

impl ControllerSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pressed(mut self, control: PhysicalControl) -> Self {
        self.pressed.insert(control);
        self
    }

    pub fn with_left_stick(mut self, x: f32, y: f32) -> Self {
        self.left_stick_x = x;
        self.left_stick_y = y;
        self
    }

    pub fn is_pressed(&self, control: PhysicalControl) -> bool {
        self.pressed.contains(&control)
    }

    /// Digitizes the sample into the set of held emulator keys.
    pub fn to_mask(&self) -> KeyBitmask {
        ButtonMap::bindings()
            .iter()
            .filter(|binding| {
                binding.controls.iter().any(|c| self.is_pressed(*c))
                    || binding
                        .stick
                        .is_some_and(|dir| dir.is_engaged(self.left_stick_x, self.left_stick_y))
            })
            .fold(0, |mask, binding| mask | binding.key.mask())
    }
}

/// A transition of the key state. `add` and `clear` never share a bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyDelta {
    pub add: KeyBitmask,
    pub clear: KeyBitmask,
}

impl KeyDelta {
    pub const WIRE_LEN: usize = 8;

    pub fn between(previous: KeyBitmask, current: KeyBitmask) -> Self {
        Self {
            add: current & !previous,
            clear: previous & !current,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.add == 0 && self.clear == 0
    }

    /// Forwards the delta to a core, clear before add.
    pub fn forward_to(&self, core: &dyn EmulatorCore) {
        if self.clear != 0 {
            core.clear_keys(self.clear);
        }
        if self.add != 0 {
            core.add_keys(self.add);
        }
    }

    /// Payload layout of an input-delta link frame: `add` then `clear`, little endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        out.extend_from_slice(&self.add.to_le_bytes());
        out.extend_from_slice(&self.clear.to_le_bytes());
        out
    }

    /// Parses a payload written by [`KeyDelta::to_bytes`]. Overlapping bits are
    /// resolved in favor of `clear`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != Self::WIRE_LEN {
            return None;
        }
        let add = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let clear = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Some(Self {
            add: add & !clear,
            clear,
        })
    }
}

/// Converts successive samples of one controller into deltas.
///
/// Only the previous digitized mask is retained between calls. Not meant to be
/// shared between threads; the hub owns one per controller.
pub struct InputMapper {
    core: Arc<dyn EmulatorCore>,
    previous: KeyBitmask,
}

impl InputMapper {
    pub fn new(core: Arc<dyn EmulatorCore>) -> Self {
        Self { core, previous: 0 }
    }

    pub fn apply(&mut self, sample: &ControllerSample) -> KeyDelta {
        let current = sample.to_mask();
        let delta = KeyDelta::between(self.previous, current);
        self.previous = current;

        if !delta.is_empty() {
            debug!(
                "Key delta: add={:#06x} clear={:#06x}",
                delta.add, delta.clear
            );
            delta.forward_to(self.core.as_ref());
        }
        delta
    }

    /// Releases every key this mapper still holds.
    pub fn release_all(&mut self) -> KeyDelta {
        let delta = KeyDelta::between(self.previous, 0);
        self.previous = 0;
        delta.forward_to(self.core.as_ref());
        delta
    }

    pub fn held(&self) -> KeyBitmask {
        self.previous
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::controller::button_map::EmulatorKey;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum CoreCall {
        Add(KeyBitmask),
        Clear(KeyBitmask),
    }

    #[derive(Default)]
    pub(crate) struct RecordingCore {
        pub(crate) calls: Mutex<Vec<CoreCall>>,
    }

    impl RecordingCore {
        pub(crate) fn calls(&self) -> Vec<CoreCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl EmulatorCore for RecordingCore {
        fn add_keys(&self, mask: KeyBitmask) {
            self.calls.lock().unwrap().push(CoreCall::Add(mask));
        }

        fn clear_keys(&self, mask: KeyBitmask) {
            self.calls.lock().unwrap().push(CoreCall::Clear(mask));
        }
    }

    fn mapper() -> (Arc<RecordingCore>, InputMapper) {
        let core = Arc::new(RecordingCore::default());
        let mapper = InputMapper::new(core.clone());
        (core, mapper)
    }

    #[test]
    fn same_sample_twice_is_empty() {
        let (_core, mut mapper) = mapper();
        let sample = ControllerSample::new()
            .with_pressed(PhysicalControl::ButtonA)
            .with_left_stick(-0.9, 0.0);

        let first = mapper.apply(&sample);
        assert_eq!(first.add, EmulatorKey::A.mask() | EmulatorKey::Left.mask());
        assert!(mapper.apply(&sample).is_empty());
    }

    #[test]
    fn add_and_clear_are_disjoint() {
        let (_core, mut mapper) = mapper();
        let samples = [
            ControllerSample::new().with_pressed(PhysicalControl::ButtonA),
            ControllerSample::new().with_pressed(PhysicalControl::ButtonB),
            ControllerSample::new()
                .with_pressed(PhysicalControl::ButtonB)
                .with_left_stick(0.0, 0.8),
            ControllerSample::new().with_pressed(PhysicalControl::LeftTrigger),
            ControllerSample::new(),
        ];
        for sample in &samples {
            let delta = mapper.apply(sample);
            assert_eq!(delta.add & delta.clear, 0);
        }
    }

    #[test]
    fn press_release_press_forwards_in_order() {
        let (core, mut mapper) = mapper();
        let pressed = ControllerSample::new().with_pressed(PhysicalControl::Menu);
        let released = ControllerSample::new();

        mapper.apply(&pressed);
        mapper.apply(&released);
        mapper.apply(&pressed);

        let bit = EmulatorKey::Start.mask();
        assert_eq!(
            core.calls(),
            vec![CoreCall::Add(bit), CoreCall::Clear(bit), CoreCall::Add(bit)]
        );
    }

    #[test]
    fn clear_is_forwarded_before_add() {
        let (core, mut mapper) = mapper();
        mapper.apply(&ControllerSample::new().with_pressed(PhysicalControl::DPadLeft));
        mapper.apply(&ControllerSample::new().with_pressed(PhysicalControl::DPadRight));

        assert_eq!(
            core.calls(),
            vec![
                CoreCall::Add(EmulatorKey::Left.mask()),
                CoreCall::Clear(EmulatorKey::Left.mask()),
                CoreCall::Add(EmulatorKey::Right.mask()),
            ]
        );
    }

    #[test]
    fn dpad_and_stick_on_same_direction_add_once() {
        let (core, mut mapper) = mapper();
        let sample = ControllerSample::new()
            .with_pressed(PhysicalControl::DPadRight)
            .with_left_stick(0.8, 0.0);

        mapper.apply(&sample);
        assert_eq!(core.calls(), vec![CoreCall::Add(EmulatorKey::Right.mask())]);

        // Letting go of only the d-pad keeps Right held through the stick.
        let stick_only = ControllerSample::new().with_left_stick(0.8, 0.0);
        assert!(mapper.apply(&stick_only).is_empty());
        assert_eq!(core.calls().len(), 1);
    }

    #[test]
    fn opposite_directions_can_be_held_together() {
        let (_core, mut mapper) = mapper();
        let sample = ControllerSample::new()
            .with_pressed(PhysicalControl::DPadLeft)
            .with_left_stick(0.9, 0.0);
        let delta = mapper.apply(&sample);
        assert_eq!(
            delta.add,
            EmulatorKey::Left.mask() | EmulatorKey::Right.mask()
        );
    }

    #[test]
    fn release_all_clears_held_keys() {
        let (core, mut mapper) = mapper();
        mapper.apply(
            &ControllerSample::new()
                .with_pressed(PhysicalControl::ButtonA)
                .with_pressed(PhysicalControl::RightShoulder),
        );
        let delta = mapper.release_all();
        assert_eq!(delta.clear, EmulatorKey::A.mask() | EmulatorKey::R.mask());
        assert_eq!(mapper.held(), 0);
        assert_eq!(core.calls().last(), Some(&CoreCall::Clear(delta.clear)));

        // Nothing held: no further calls.
        mapper.release_all();
        assert_eq!(core.calls().len(), 2);
    }

    #[test]
    fn wire_payload_resolves_overlap_to_clear() {
        let delta = KeyDelta { add: 0b11, clear: 0b100 };
        assert_eq!(KeyDelta::from_bytes(&delta.to_bytes()), Some(delta));

        let mut bytes = KeyDelta { add: 0b11, clear: 0 }.to_bytes();
        bytes[4] = 0b10;
        let parsed = KeyDelta::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.add, 0b01);
        assert_eq!(parsed.clear, 0b10);
        assert_eq!(KeyDelta::from_bytes(&[1, 2, 3]), None);
    }
}
