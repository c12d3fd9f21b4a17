//! QUIC transport for [`CsiMessage`](crate::message::CsiMessage) exchanges.

pub mod client;
pub mod server;

pub use client::CsiClient;
pub use server::CsiServer;
