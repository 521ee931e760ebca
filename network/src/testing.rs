//! In-memory [`LinkOps`] and DHCP client packets used by the tests.

use crate::dhcp::packet::{
    BOOTREQUEST, MAGIC_COOKIE, MessageType, OPT_END, OPT_MESSAGE_TYPE, OPT_PARAMETER_REQUEST_LIST,
};
use crate::error::NetError;
use crate::transit::{InterfaceInfo, LinkOps};
use cvmm_core::{MacAddr, RouteEntry};
use ipnetwork::Ipv4Network;
use std::collections::HashMap;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Default)]
pub struct FakeLink {
    pub mac: MacAddr,
    pub addresses: Vec<Ipv4Network>,
    pub master: Option<String>,
    pub up: bool,
    pub is_bridge: bool,
    pub is_tap: bool,
    pub ageing_disabled: bool,
}

#[derive(Default)]
pub struct FakeLinks {
    links: Vec<(String, FakeLink)>,
    routes: Vec<(String, RouteEntry)>,
    initial_macs: HashMap<String, MacAddr>,
    next_mac: u8,
    /// Mimic kernels that rewrite hardware addresses when a master is set.
    pub clobber_mac_on_attach: bool,
    pub fail_bridge: Option<String>,
}

impl FakeLinks {
    pub fn add_interface(&mut self, name: &str, mac: MacAddr, addresses: &[&str]) {
        let addresses = addresses.iter().map(|a| a.parse().unwrap()).collect();
        self.links.push((
            name.to_string(),
            FakeLink {
                mac,
                addresses,
                ..Default::default()
            },
        ));
    }

    pub fn add_route(&mut self, iface: &str, destination: Option<&str>, gateway: Option<[u8; 4]>) {
        let route = RouteEntry::new(
            destination.map(|d| d.parse().unwrap()),
            gateway.map(Ipv4Addr::from),
        );
        self.routes.push((iface.to_string(), route));
    }

    pub fn try_link(&self, name: &str) -> Option<&FakeLink> {
        self.links.iter().find(|(n, _)| n == name).map(|(_, l)| l)
    }

    pub fn link(&self, name: &str) -> &FakeLink {
        self.try_link(name)
            .unwrap_or_else(|| panic!("link {name} does not exist"))
    }

    pub fn initial_bridge_mac(&self, name: &str) -> MacAddr {
        self.initial_macs[name]
    }

    fn link_mut(&mut self, name: &str) -> Result<&mut FakeLink, NetError> {
        self.links
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, l)| l)
            .ok_or_else(|| NetError::InterfaceNotFound(name.to_string()))
    }

    fn kernel_mac(&mut self) -> MacAddr {
        self.next_mac += 1;
        MacAddr::new([0x06, 0, 0, 0, 0, self.next_mac])
    }

    fn create(&mut self, name: &str, link: FakeLink) -> Result<(), NetError> {
        if self.try_link(name).is_some() {
            return Err(NetError::Netlink(format!("{name}: File exists (os error 17)")));
        }
        self.initial_macs.insert(name.to_string(), link.mac);
        self.links.push((name.to_string(), link));
        Ok(())
    }
}

impl LinkOps for FakeLinks {
    fn interfaces(&mut self) -> Result<Vec<InterfaceInfo>, NetError> {
        Ok(self
            .links
            .iter()
            .map(|(name, link)| InterfaceInfo {
                name: name.clone(),
                addresses: link.addresses.clone(),
            })
            .collect())
    }

    fn routes(&mut self, name: &str) -> Result<Vec<RouteEntry>, NetError> {
        Ok(self
            .routes
            .iter()
            .filter(|(iface, _)| iface == name)
            .map(|(_, r)| *r)
            .collect())
    }

    fn link_mac(&mut self, name: &str) -> Result<MacAddr, NetError> {
        Ok(self.link_mut(name)?.mac)
    }

    fn set_mac(&mut self, name: &str, mac: MacAddr) -> Result<(), NetError> {
        self.link_mut(name)?.mac = mac;
        Ok(())
    }

    fn delete_address(&mut self, name: &str, addr: Ipv4Network) -> Result<(), NetError> {
        let link = self.link_mut(name)?;
        let before = link.addresses.len();
        link.addresses.retain(|a| *a != addr);
        if link.addresses.len() == before {
            return Err(NetError::Netlink(format!("{addr} not assigned to {name}")));
        }
        Ok(())
    }

    fn create_tap(&mut self, name: &str) -> Result<(), NetError> {
        let mac = self.kernel_mac();
        self.create(
            name,
            FakeLink {
                mac,
                is_tap: true,
                ..Default::default()
            },
        )
    }

    fn create_bridge(&mut self, name: &str) -> Result<(), NetError> {
        if self.fail_bridge.as_deref() == Some(name) {
            return Err(NetError::Netlink(format!("create bridge {name}: refused")));
        }
        let mac = self.kernel_mac();
        self.create(
            name,
            FakeLink {
                mac,
                is_bridge: true,
                ageing_disabled: true,
                ..Default::default()
            },
        )
    }

    fn set_master(&mut self, name: &str, master: &str) -> Result<(), NetError> {
        if !self.link_mut(master)?.is_bridge {
            return Err(NetError::Netlink(format!("{master} is not a bridge")));
        }
        let clobber = self.clobber_mac_on_attach;
        let garbage = self.kernel_mac();

        let link = self.link_mut(name)?;
        link.master = Some(master.to_string());
        let previous = link.mac;
        if clobber {
            link.mac = garbage;
            self.link_mut(master)?.mac = previous;
        }
        Ok(())
    }

    fn set_up(&mut self, name: &str) -> Result<(), NetError> {
        self.link_mut(name)?.up = true;
        Ok(())
    }
}

/// A client request as sent by a guest, with xid `deadbeef`.
pub fn dhcp_request(message_type: MessageType, mac: MacAddr, params: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; 240];
    raw[0] = BOOTREQUEST;
    raw[1] = 1;
    raw[2] = 6;
    raw[4..8].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
    raw[28..34].copy_from_slice(&mac.octets());
    raw[236..240].copy_from_slice(&MAGIC_COOKIE);

    raw.extend_from_slice(&[OPT_MESSAGE_TYPE, 1, message_type.as_u8()]);
    if !params.is_empty() {
        raw.push(OPT_PARAMETER_REQUEST_LIST);
        raw.push(params.len() as u8);
        raw.extend_from_slice(params);
    }
    raw.push(OPT_END);
    raw
}
