//! Shared-memory RPC transport between a CPU driver and the GSP or a vGPU host
//! plugin.
//!
//! The CPU and its peer exchange fixed-size, checksummed elements through two
//! single-producer rings (command and status) in one shared region. On top of
//! that sit a request/response engine ([`rpc::RpcEngine`]), splitting of large
//! messages into continuation records ([`chunk`]), a queue-less doorbell path
//! ([`doorbell`]) and a bulk hibernation stream ([`hibernation`]).

pub mod checksum;
pub mod chunk;
pub mod config;
pub mod device;
pub mod doorbell;
pub mod element;
pub mod error;
pub mod event;
pub mod hibernation;
pub mod layout;
pub mod message;
pub mod meter;
pub mod poll;
pub mod queue;
pub mod records;
pub mod rpc;
pub mod shmem;
pub mod sim;
pub mod version;

pub use config::TransportConfig;
pub use device::Device;
pub use error::{Result, RpcError};
pub use message::{Function, RpcMessage};
pub use rpc::{RpcEngine, RpcTransport};
