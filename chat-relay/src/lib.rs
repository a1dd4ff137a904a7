//! Directed text chat relay over TCP.
//!
//! Clients send a name as their first line, then `recipient:body` lines. The
//! relay forwards each body to the named recipient as `@sender: body`, or
//! answers the sender with a `[System]` notice when it cannot.
//!
//! - [`cli`] parses the listen address and line limit.
//! - [`router`] runs the accept loop and forwards messages between sessions.
//! - [`session`] drives one connection: login, directive loop, cleanup.
//! - [`registry`] maps logged-in names to session handles behind a lock.
//! - [`protocol`] holds the line framing, directive parser, and wire text.
//!
//! Integration tests use this crate directly to run a relay in-process.

pub mod cli;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;
