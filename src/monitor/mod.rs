//! Monitor - the consumer side.
//!
//! An [`EventMonitor`] drives one [`MonitorBackend`] through
//!
//! ```text
//! Disconnected ──▶ Connecting ──▶ Subscribed ──▶ (error) Disconnected
//!       ▲                                               │
//!       └──────────────── fixed delay, forever ─────────┘
//! ```
//!
//! and pushes each received message, normalized into an [`InboundEvent`],
//! onto a caller-owned channel. Pushing waits when the channel is full.
//! Acknowledgement follows the backend's [`AckMode`].

mod backend;
mod event;
#[allow(clippy::module_inception)]
mod monitor;

pub use backend::{AckMode, MonitorBackend, MonitorError};
pub use event::{InboundEvent, WireMessage};
pub use monitor::{EventMonitor, MonitorConfig, MonitorHandle, MonitorState, MonitorStats};
