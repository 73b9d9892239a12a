//! Core library for the doux bridge.
//!
//! Textual commands are encoded by [`protocol`], sample references are
//! resolved into the engine's pool by [`samples`], and [`bridge`] hosts the
//! engine on an isolated render thread. [`scope`] and [`timeline`] carry the
//! render thread's visualization snapshots and clock ticks back out, and
//! [`session`] ties the pieces into one command surface. [`osc`] turns
//! incoming OSC packets into events.

pub mod bridge;
pub mod config;
pub mod error;
pub mod osc;
pub mod protocol;
pub mod samples;
pub mod scope;
pub mod session;
pub mod timeline;

pub use bridge::{AuthorizationGate, BridgeState, EngineBridge, EngineSource};
pub use config::{AudioConfig, BridgeConfig, SampleConfig, ScopeConfig};
pub use error::{BridgeError, Result};
pub use protocol::{encode_path, parse_path, EncodedCommand, Event, Value};
pub use samples::{SampleLoader, SampleRecord, SoundKey};
pub use scope::{ScopeCapture, ScopeFrame, VisualizationSnapshot};
pub use session::{PreparedMessage, Session};
pub use timeline::{ClockTick, TransportClock};
