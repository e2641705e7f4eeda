//! Controller subsystem for gamepad input handling
//!
//! Turns host gamepad events into emulator key deltas:
//!
//! 1. [`event_collector`] - gilrs polling on a dedicated thread
//! 2. [`controller_hub`] - controller registry, one mapper per pad
//! 3. [`input_mapper`] - sample → add/clear delta, forwarded to the core
//! 4. [`button_map`] - fixed physical control → key bit table
//!
//! # Architecture
//!
//! ```text
//! Gamepad ──► Collector ──► Hub ──► InputMapper ──► KeyAggregator ──► EmulatorCore
//!            (PlatformEvent)        (KeyDelta)       (ref counts)
//! ```

pub mod button_map;
pub mod controller_handle;
pub mod controller_hub;
pub mod event_collector;
pub mod input_mapper;

pub use button_map::{ButtonBinding, ButtonMap, EmulatorKey, KeyBitmask, PhysicalControl};
pub use controller_handle::{ControllerError, ControllerHandle, ControllerSettings};
pub use controller_hub::{ControllerHub, ControllerId, HubEvent, KeyAggregator, PlatformEvent};
pub use input_mapper::{ControllerSample, EmulatorCore, InputMapper, KeyDelta};
