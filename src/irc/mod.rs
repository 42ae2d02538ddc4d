//! IRC delivery.
//!
//! - [`transport`] - the wire boundary: a [`Transport`] trait seams the
//!   dispatcher from the network, and [`IrcClient`] implements it over a
//!   plain TCP line connection (register, join, keepalive, PRIVMSG)
//! - [`dispatcher`] - flood-controlled fan-out: per-channel FIFO queues,
//!   a minimum gap between sends to the same channel, bounded delivery
//!   retries, loud drops

mod dispatcher;
mod transport;

pub use dispatcher::{spawn_dispatcher, DispatcherConfig, DispatcherHandle, OutboundMessage};
pub use transport::{IrcClient, IrcSettings, Transport, TransportError};
