//! Line-oriented TCP message relay.
//!
//! The server assigns every connection a numeric identity and routes
//! newline-delimited text between identities; the client is a small
//! terminal front end for picking a destination and chatting with it.
//! Each module focuses on a concrete responsibility:
//!
//! - [`cli`] parses the command-line interface for server and client
//!   modes.
//! - [`frame`] provides the `kind:payload` line protocol plus helpers
//!   for async reads and writes.
//! - [`registry`] tracks live connections and allocates identities
//!   behind one lock.
//! - [`server`] accepts TCP connections, runs one reader and one writer
//!   task per connection, and routes every message through a single
//!   dispatcher.
//! - [`client`] connects to the server, multiplexing stdin and server
//!   frames for a terminal user.
//!
//! Integration and end-to-end tests use this crate directly to exercise
//! the registry, the wire protocol, and the routing path.

pub mod cli;
pub mod client;
pub mod frame;
pub mod registry;
pub mod server;
