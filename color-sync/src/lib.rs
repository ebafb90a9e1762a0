//! Shared color synchronization over WebSockets.
//!
//! A hub keeps one authoritative color and rebroadcasts every accepted
//! update to all parties; clients follow it through a channel that
//! reconnects on its own. Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for hub and client modes.
//! - [`color`] defines the shared color and its textual wire format.
//! - [`hub`] accepts connections on a secure and a plain endpoint, validates
//!   updates and fans them out to both registries.
//! - [`channel`] keeps a reconnecting subscription to the hub and exposes
//!   inbound snapshots as one continuous stream.
//! - [`client`] drives a channel from the terminal (`watch` and `set`).
//! - [`tls`] loads the certificate used by the secure endpoint.
//!
//! Integration and unit tests use this crate directly to exercise the hub
//! registries, the channel state machine and the wire format.

pub mod channel;
pub mod cli;
pub mod client;
pub mod color;
pub mod hub;
pub mod tls;
