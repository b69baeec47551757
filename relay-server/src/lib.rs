//! Horizontally scalable WebSocket chat relay.
//!
//! Every process is a *node*. Clients connect over WebSocket, receive a
//! reusable integer identity, and exchange `group` (everyone, every node)
//! or `once` (one user, wherever they are attached) messages. Nodes share a
//! presence store that maps users to their owning node and a broker with one
//! queue per node.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod identity;
pub mod presence;
pub mod registry;
pub mod server;
pub mod store;
pub mod web;

/// Integer user identity as it appears on the wire.
pub type UserId = i64;
