//! Peer-to-peer networking
//!
//! Nodes exchange JSON-encoded packages over short-lived TCP connections to
//! announce, request and relay blocks and transactions.

pub mod node;
pub mod server;
pub mod sync;

pub use node::{Node, Nodes};
pub use server::{send_data, send_tx, Envelope, NodeContext, OpType, Package, Server};
pub use sync::{Delivery, SyncState};
