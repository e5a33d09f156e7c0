//! Reliable event dispatch over interchangeable message brokers.
//!
//! Producers hand events to a [`Dispatcher`], which queues them, publishes
//! them through a [`QueueAdapter`] and retries failed publishes a bounded
//! number of times. Consumers run an [`EventMonitor`], which keeps a
//! subscription alive against a [`MonitorBackend`] and pushes normalized
//! [`InboundEvent`]s onto a channel the caller owns.
//!
//! Three broker families are supported (AMQP topic exchanges, STOMP
//! brokers and cloud pub/sub) plus an in-memory broker for tests. The
//! family is picked at runtime from [`BrokerConfig`]:
//!
//! ```ignore
//! use sourced_dispatch::{Adapter, BrokerConfig, Dispatcher, EnvSource};
//!
//! let config = BrokerConfig::from_source(&EnvSource)?;
//! let dispatcher = Dispatcher::spawn(Adapter::from_config(&config));
//! ```
//!
//! Delivery is at-least-once within the retry budget and best-effort
//! beyond it: once retries are spent the event is logged and dropped.
//! Callers are never told about publish failures.

pub mod broker;
pub mod config;
pub mod dispatch;
pub mod monitor;
pub mod routing;

pub use broker::{Adapter, InMemoryBroker, Monitor};
pub use config::{Backend, BrokerConfig, ConfigError, ConfigSource, EnvSource};
pub use dispatch::{
    DispatchConfig, Dispatcher, DispatcherStats, Headers, OutboundCommand, Payload,
    PublishError, QueueAdapter,
};
pub use monitor::{
    AckMode, EventMonitor, InboundEvent, MonitorBackend, MonitorConfig, MonitorError,
    MonitorHandle, MonitorState, WireMessage,
};
pub use routing::{to_dot_routing, to_underscore_routing};
