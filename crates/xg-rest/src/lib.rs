//! # xg-rest
//!
//! Resilient REST access to the exchange.
//!
//! - [`client::RestClient`] walks a prioritized host list for every logical
//!   request and classifies the response status.
//! - [`backoff::BackoffGate`] is the shared cooldown armed by 429/418
//!   responses; every attempt waits on it before touching the network.
//!
//! ```text
//! get(path, query)
//! └── for host in hosts
//!     ├── BackoffGate::wait
//!     ├── GET scheme://host/path?query
//!     └── < 500 → stop, ≥ 500 or network error → next host
//! ```

pub mod backoff;
pub mod client;

pub use backoff::BackoffGate;
pub use client::{RestClient, encode_query};
