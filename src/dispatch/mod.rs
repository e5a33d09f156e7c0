//! Dispatch - the producer side.
//!
//! ## Architecture
//!
//! ```text
//!  dispatch_event()          ┌──────────────────────────────┐
//! ───────────────▶ send queue│                              │
//!       (bounded, 200)  ────▶│         publish loop         │──▶ QueueAdapter::publish
//!                            │  (single task, serialized)   │
//!        retry queue ───────▶│                              │
//!            ▲               └──────────────┬───────────────┘
//!            │ after 1s                     │ failure
//!            └──────── attempt < 3 ◀────────┤
//!                                           │ connection failure
//!                                           ▼
//!                            ┌──────────────────────────────┐
//!                            │    connection supervisor     │──▶ QueueAdapter::connect
//!                            │ (holds the gate while busy)  │
//!                            └──────────────────────────────┘
//! ```
//!
//! The publish loop passes through the connection gate before every
//! publish, so no publish overlaps a reconnect.

mod adapter;
mod command;
mod dispatcher;
mod supervisor;

pub use adapter::{
    Headers, PublishError, QueueAdapter, AUTHORIZATION_HEADER, CORRELATION_ID_HEADER,
};
pub use command::{EncodeJsonPayload, OutboundCommand, Payload, RetryEnvelope};
pub use dispatcher::{DispatchConfig, Dispatcher, DispatcherStats};
