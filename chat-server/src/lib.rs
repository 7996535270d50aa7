//! Real-time chat server: connection handling, presence, and routing.
//!
//! Clients speak a JSON line protocol: one [`message::WireMessage`] per
//! line. A connection starts unauthenticated and identifies itself with a
//! `SYSTEM` message whose content is `login <secret>`. Once authenticated,
//! `TEXT`, `IMAGE` and `FILE` messages are delivered to every online
//! participant of their chat.
//!
//! - [`message`] defines the wire message and line framing.
//! - [`registry`] maps online user ids to their sessions.
//! - [`session`] runs one connection: read loop, identification, dispatch.
//! - [`server`] accepts connections and exposes routing and presence.
//! - [`services`] holds the identity, membership, and persistence
//!   collaborators plus in-memory implementations.
//! - [`config`] loads the server configuration file.
//! - [`cli`] and [`client`] provide the command line and the client side.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod registry;
pub mod server;
pub mod services;
pub mod session;
