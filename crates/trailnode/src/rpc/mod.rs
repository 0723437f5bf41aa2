//! Node-to-node RPC over WebSocket.

pub mod client;
pub mod server;

pub use client::RemoteLink;
pub use server::RpcServer;
