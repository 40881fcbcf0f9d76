//! GeoGrid Protocol - Full-Duplex Messaging for the Cache Grid
//!
//! Every participant in a GeoGrid (coordinator, cache nodes, clients) talks
//! over [`MessagingChannel`]s: one per TCP connection, each with its own
//! inbound and outbound task.
//!
//! # Overview
//!
//! - **Correlation ids**: every request carries an id; the response comes
//!   back with the same id and is routed to the handler registered for it.
//! - **Never blocking**: [`MessagingChannel::send_async`] registers the pending
//!   call, queues the envelope and returns.
//! - **Exactly one response**: each request is answered once, and answers are
//!   never answered.
//! - **No reconnection**: a lost connection closes the channel and abandons
//!   every pending call.
//!
//! The wire format is newline-delimited JSON [`Envelope`]s wrapping a tagged
//! [`Message`].
//!
//! # Example
//!
//! ```rust,ignore
//! use geogrid_protocol::{handler_fn, Message, MessagingChannel, NodeAddress};
//!
//! let coordinator: NodeAddress = "127.0.0.1:7000".parse()?;
//! let channel = MessagingChannel::connect(&coordinator, handler_fn(|_, m| m)).await?;
//!
//! let reply = channel.request(Message::Join { address, location }).await?;
//! assert!(reply.is_ack());
//! ```

pub mod address;
pub mod channel;
pub mod error;
pub mod listener;
pub mod message;
pub mod telemetry;

pub use address::NodeAddress;
pub use channel::{handler_fn, HandlerFn, MessageHandler, MessagingChannel, ResponseHandler};
pub use error::{Error, Result};
pub use listener::bind_listener;
pub use message::{
    CorrelationId, Envelope, Message, MessageKind, NeighborInfo, QueryMessage, NOTIFICATION_ID,
    STATUS_DUPLICATE, STATUS_FULL, STATUS_GROWTH_REJECTED, STATUS_NOT_SIGNUP, STATUS_OK,
    STATUS_PROTOCOL_VIOLATION,
};
pub use telemetry::{tracing_sink, LogSink, MemorySink, SharedSink, TracingSink};

// Re-export the location type carried by messages.
pub use geogrid_topology::Location;
