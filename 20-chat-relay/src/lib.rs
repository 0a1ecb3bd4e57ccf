//! Two-way chat relay over reverse connections.
//!
//! A hub keeps a registry of subscribers. Each participant runs its own small
//! server, registers that server's address with the hub, and publishes chat
//! to the hub; the hub opens a connection back to every registered
//! participant and rebroadcasts each message over it. A subscriber whose
//! delivery fails is dropped from the registry during the same broadcast.
//!
//! - [`cli`] parses the command line for hub and participant modes.
//! - [`message`] defines the JSON line protocol and its framing helpers.
//! - [`channel`] is the lazy client connection with observable connectivity.
//! - [`server`] is the accept loop both roles use to serve requests.
//! - [`hub`] holds the registry and the broadcast-and-prune sweep.
//! - [`participant`] runs the local inbox, the liveness watcher that keeps the
//!   participant registered, and the terminal loop.

pub mod channel;
pub mod cli;
pub mod hub;
pub mod message;
pub mod participant;
pub mod server;
