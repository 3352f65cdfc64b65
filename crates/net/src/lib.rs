//! Networking for quorumkv: the framed TCP server, the request dispatcher,
//! and the client side (peer transport + persistent client connection).

pub mod client;
pub mod coordinator;
pub mod server;

pub use client::{ClusterInfo, KvClient, MemberSummary, PeerClient};
pub use coordinator::Coordinator;
pub use server::{bind, run, ServerError};
