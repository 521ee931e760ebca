//! Single-lease DHCP servers, one per transited interface.
//!
//! Each server answers exactly one client, the guest NIC whose MAC the
//! container interface used to carry, with the address, routes and
//! resolvers that interface had. Leases never expire.

pub mod packet;
mod server;

pub use server::{DhcpServer, INFINITE_LEASE, SERVER_PORT};

use crate::error::NetError;
use crate::resolv;
use cvmm_core::NetworkTransit;
use std::net::Ipv4Addr;
use std::path::Path;

/// Operator overrides for the resolver and time servers handed out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpSettings {
    /// Replaces the nameservers read from the resolver configuration.
    pub dns_servers: Vec<Ipv4Addr>,
    pub ntp_servers: Vec<Ipv4Addr>,
}

/// Fill in the guest-facing settings of every transit and build its server.
pub fn prepare_servers(
    guest_name: &str,
    transits: Vec<NetworkTransit>,
    settings: &DhcpSettings,
    resolv_conf: &Path,
) -> Result<Vec<DhcpServer>, NetError> {
    let dns_servers = if settings.dns_servers.is_empty() {
        resolv::nameservers(resolv_conf)?
    } else {
        settings.dns_servers.clone()
    };
    tracing::debug!(?dns_servers, ntp_servers = ?settings.ntp_servers, "DHCP settings");

    Ok(transits
        .into_iter()
        .map(|mut transit| {
            transit.hostname = guest_name.to_string();
            transit.dns_servers = dns_servers.clone();
            transit.ntp_servers = settings.ntp_servers.clone();
            DhcpServer::new(transit)
        })
        .collect())
}
