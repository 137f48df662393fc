//! # xg-stream
//!
//! Client side of the exchange's combined stream protocol: one WebSocket
//! carrying pushes for many channels plus method calls and their replies.
//!
//! ## Architecture
//!
//! ```text
//! Stream
//! ├── Correlator   id → reply slot for in-flight method calls
//! ├── Registry     channel → PushHandler
//! ├── sender task  queue → RateLimiter → socket
//! └── listener task socket → decode → correlator | registry
//! ```
//!
//! Pushes are delivered from inside the listener task, one at a time, in
//! arrival order across all channels. A slow handler therefore delays every
//! channel on the connection; [`ChannelHandler`] logs a warning for every
//! second it keeps the listener blocked.

pub mod correlator;
pub mod dial;
pub mod handler;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use handler::{ChannelHandler, PushHandler};
pub use protocol::{InboundMessage, OutboundMessage, WireError};
pub use transport::{Stream, StreamState};
