//! Network subsystem: UDP transport, fragmentation, reassembly and the
//! host/viewer protocol endpoints

pub mod assembler;
pub mod client;
pub mod fragment;
pub mod server;
pub mod socket;

pub use assembler::{IncompleteKeyframe, Reassembler};
pub use client::{Client, ConnectionState};
pub use fragment::Fragmenter;
pub use server::Server;
pub use socket::UdpEndpoint;
