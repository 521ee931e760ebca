//! Container-side networking for the guest VM.
//!
//! Moves the container's IPv4 configuration off its interfaces onto
//! bridge/TAP pairs and answers the guest's DHCP requests with exactly
//! that configuration.

pub mod dhcp;
mod error;
mod netlink;
pub mod resolv;
pub mod routes;
mod tap;
pub mod transit;

#[cfg(test)]
pub(crate) mod testing;

pub use dhcp::{DhcpServer, DhcpSettings, prepare_servers};
pub use error::NetError;
pub use transit::{InterfaceInfo, KernelLinks, LinkOps, setup_interfaces};
