//! arbor-server: a spanning-tree IRC server core.
//!
//! Servers link over TCP (optionally TLS), authenticate with a CAPAB
//! capability exchange and an HMAC challenge, replay their state in a
//! netburst, and keep a distributed tree consistent with
//! timestamp-based conflict resolution.

pub mod burst;
pub mod collide;
pub mod commands;
pub mod config;
pub mod error;
pub mod link;
pub mod netsplit;
pub mod oper;
pub mod router;
pub mod server;
pub mod state;
pub mod tree;
pub mod util;
