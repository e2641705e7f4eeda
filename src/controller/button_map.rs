//! Static binding table from physical gamepad controls to emulator key bits.
//!
//! The table has exactly one entry per emulator key. An entry lists every
//! physical source that holds the key: a set of digital controls and, for the
//! four directions, a left-stick axis direction.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Emulator key state, one bit per [`EmulatorKey`].
pub type KeyBitmask = u32;

/// Magnitude a stick axis has to exceed before it counts as a directional press.
pub const ANALOG_THRESHOLD: f32 = 0.5;

/// Logical emulator keys with their bit index in a [`KeyBitmask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmulatorKey {
    A = 0,
    B = 1,
    Select = 2,
    Start = 3,
    Right = 4,
    Left = 5,
    Up = 6,
    Down = 7,
    R = 8,
    L = 9,
}

impl EmulatorKey {
    pub const fn bit_index(self) -> u32 {
        self as u32
    }

    pub const fn mask(self) -> KeyBitmask {
        1 << self.bit_index()
    }
}

impl fmt::Display for EmulatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Digital controls a host gamepad can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PhysicalControl {
    ButtonA,
    ButtonB,
    Options,
    Menu,
    DPadRight,
    DPadLeft,
    DPadUp,
    DPadDown,
    RightShoulder,
    RightTrigger,
    LeftShoulder,
    LeftTrigger,
}

/// A left-stick direction that digitizes into a press.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StickDirection {
    PositiveX,
    NegativeX,
    PositiveY,
    NegativeY,
}

impl StickDirection {
    /// Whether the stick position counts as a press in this direction.
    pub fn is_engaged(self, x: f32, y: f32) -> bool {
        match self {
            StickDirection::PositiveX => x > ANALOG_THRESHOLD,
            StickDirection::NegativeX => x < -ANALOG_THRESHOLD,
            StickDirection::PositiveY => y > ANALOG_THRESHOLD,
            StickDirection::NegativeY => y < -ANALOG_THRESHOLD,
        }
    }
}

/// One row of the binding table.
#[derive(Debug, Clone, Copy)]
pub struct ButtonBinding {
    pub key: EmulatorKey,
    pub controls: &'static [PhysicalControl],
    pub stick: Option<StickDirection>,
}

pub struct ButtonMap;

impl ButtonMap {
    pub const BINDINGS: [ButtonBinding; 10] = [
        ButtonBinding {
            key: EmulatorKey::A,
            controls: &[PhysicalControl::ButtonA],
            stick: None,
        },
        ButtonBinding {
            key: EmulatorKey::B,
            controls: &[PhysicalControl::ButtonB],
            stick: None,
        },
        ButtonBinding {
            key: EmulatorKey::Select,
            controls: &[PhysicalControl::Options],
            stick: None,
        },
        ButtonBinding {
            key: EmulatorKey::Start,
            controls: &[PhysicalControl::Menu],
            stick: None,
        },
        ButtonBinding {
            key: EmulatorKey::Right,
            controls: &[PhysicalControl::DPadRight],
            stick: Some(StickDirection::PositiveX),
        },
        ButtonBinding {
            key: EmulatorKey::Left,
            controls: &[PhysicalControl::DPadLeft],
            stick: Some(StickDirection::NegativeX),
        },
        ButtonBinding {
            key: EmulatorKey::Up,
            controls: &[PhysicalControl::DPadUp],
            stick: Some(StickDirection::PositiveY),
        },
        ButtonBinding {
            key: EmulatorKey::Down,
            controls: &[PhysicalControl::DPadDown],
            stick: Some(StickDirection::NegativeY),
        },
        ButtonBinding {
            key: EmulatorKey::R,
            controls: &[PhysicalControl::RightShoulder, PhysicalControl::RightTrigger],
            stick: None,
        },
        ButtonBinding {
            key: EmulatorKey::L,
            controls: &[PhysicalControl::LeftShoulder, PhysicalControl::LeftTrigger],
            stick: None,
        },
    ];

    pub fn bindings() -> &'static [ButtonBinding] {
        &Self::BINDINGS
    }

    /// Looks up the row for a key.
    pub fn binding_for(key: EmulatorKey) -> &'static ButtonBinding {
        // Rows are ordered by bit index.
        &Self::BINDINGS[key.bit_index() as usize]
    }

    /// Every bit the table can ever produce.
    pub fn all_keys_mask() -> KeyBitmask {
        Self::BINDINGS.iter().fold(0, |mask, b| mask | b.key.mask())
    }
}

/// Renders a mask as a list of key names for log output.
pub fn describe_mask(mask: KeyBitmask) -> String {
    let names: Vec<String> = ButtonMap::bindings()
        .iter()
        .filter(|b| mask & b.key.mask() != 0)
        .map(|b| b.key.to_string())
        .collect();
    format!("[{}]", names.join(", "))
}
