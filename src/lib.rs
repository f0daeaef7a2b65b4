//! # bootlease
//!
//! The address-allocation core of a netboot DHCP server (RFC 2131, RFC 2132).
//!
//! ## Features
//!
//! - DISCOVER/OFFER and REQUEST/ACK/NAK over a fixed contiguous pool
//! - RELEASE and DECLINE free the client's binding
//! - Expired leases are reclaimed lazily, on the next allocation
//! - Reply options follow the client's Parameter Request List
//! - PXE boot file handed out in every OFFER and ACK
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use bootlease::{Config, DhcpServer};
//!
//! #[tokio::main]
//! async fn main() -> bootlease::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let server = DhcpServer::new(config).await?;
//!     server.run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Pool, lease duration and boot options
//! - [`LeaseManager`] - Decides the reply for each inbound message
//! - [`LeaseTable`] - Index-keyed lease bookkeeping behind the manager
//! - [`DhcpServer`] - UDP transport on port 67
//!
//! Messages are decoded and encoded with [`dhcproto`].

pub mod config;
pub mod error;
pub mod lease;
pub mod manager;
pub mod options;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use lease::{Claim, Lease, LeasePool, LeaseTable};
pub use manager::{LeaseManager, Reply, Silence};
pub use options::ServerOptions;
pub use server::DhcpServer;
