//! Link session layer.
//!
//! Connects independent emulator instances over TCP so their inputs can be
//! exchanged while the games run:
//!
//! - [`frame_codec`] - length-prefixed, checksummed wire frames
//! - [`connection`] - one task and state machine per peer socket
//! - [`session`] - the hosting/joining actor and its handle
//! - [`discovery`] - UDP broadcast advertisement of hosted sessions
//! - [`remote_input`] - applies a peer's input frames to a second key slot
//!
//! ```text
//! LinkSessionHandle ──cmd──► LinkSessionManager ──► ConnectionHandle ──► TCP
//!        ▲                          │  ▲                   │
//!        └──────── LinkEvent ───────┘  └─ ConnectionEvent ─┘
//! ```

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod frame_codec;
pub mod remote_input;
pub mod session;

/// Fixed TCP port for hosting and the default port for joining.
pub const LINK_PORT: u16 = 8888;
pub const SERVICE_NAME: &str = "mGBA-Multiplayer";
pub const SERVICE_TYPE: &str = "_mgba._tcp";

pub use config::{LinkSettings, ReconnectPolicy, DISCOVERY_PORT};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionState};
pub use discovery::{Advertiser, DiscoveredHost, DiscoveryListener, ServiceAnnouncement};
pub use error::LinkError;
pub use frame_codec::{CodecError, Frame, FrameDecoder, FrameKind};
pub use remote_input::{RemoteInputSlot, RemotePeers};
pub use session::{LinkEvent, LinkSessionHandle, LinkStatus, SessionRole};
