//! Channel control surface
//!
//! A newline-delimited JSON RPC over TCP and the manager that maps channel
//! ids to running playout instances. Handlers never block on the pacing
//! loop; every operation is request/response.

mod channel;
mod server;

pub use channel::ChannelManager;
pub use server::{Request, Response, serve};

/// Control protocol version reported by GetVersion.
pub const API_VERSION: u32 = 3;
