use crate::guest::GuestNic;
use crate::mac::MacAddr;
use ipnetwork::Ipv4Network;
use serde::Serialize;
use std::net::Ipv4Addr;

/// A route discovered on a container interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouteEntry {
    /// `None` is the default route.
    pub destination: Option<Ipv4Network>,
    pub gateway: Option<Ipv4Addr>,
}

impl RouteEntry {
    pub fn new(destination: Option<Ipv4Network>, gateway: Option<Ipv4Addr>) -> Self {
        Self {
            destination,
            gateway,
        }
    }

    pub fn is_default(&self) -> bool {
        self.destination.is_none_or(|dst| dst.prefix() == 0)
    }
}

/// The network configuration taken from one container interface and
/// handed to the guest through a bridge and TAP pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkTransit {
    /// Source interface inside the container.
    pub interface: String,
    pub guest_net: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub routes: Vec<RouteEntry>,
    pub bridge: String,
    pub tap: String,
    /// Original MAC of the source interface, now carried by the TAP.
    pub guest_mac: MacAddr,
    /// Freshly generated MAC given to the source interface.
    pub host_mac: MacAddr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub ntp_servers: Vec<Ipv4Addr>,
    pub hostname: String,
}

impl NetworkTransit {
    pub fn guest_ip(&self) -> Ipv4Addr {
        self.guest_net.ip()
    }

    pub fn nic(&self) -> GuestNic {
        GuestNic {
            tap: self.tap.clone(),
            mac: self.guest_mac,
            ip: self.guest_net.ip(),
            gateway: self.gateway,
        }
    }
}
