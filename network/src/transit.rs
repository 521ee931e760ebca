//! Interface transit: hand the container's network identity to the guest.
//!
//! For every container interface (except loopback) the IPv4 address is
//! removed, a `br-<iface>` bridge joins the interface with a fresh
//! `tap-<iface>` device, and the TAP takes over the interface's original
//! MAC address. The infrastructure outside the container keeps seeing
//! traffic from the MAC it knows, now coming from the guest.

use crate::error::NetError;
use crate::netlink::NetlinkHandle;
use crate::tap;
use cvmm_core::{GuestSpec, MacAddr, NetworkTransit, RouteEntry};
use ipnetwork::Ipv4Network;
use nix::ifaddrs::getifaddrs;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

/// Container interfaces never handed to the guest.
const IGNORED_INTERFACES: &[&str] = &["lo"];

pub const PROC_NET_ROUTE: &str = "/proc/net/route";

/// A container-visible network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub addresses: Vec<Ipv4Network>,
}

/// Kernel link operations used by the transit.
pub trait LinkOps {
    fn interfaces(&mut self) -> Result<Vec<InterfaceInfo>, NetError>;

    /// Routes of the main table going out through `name`, in kernel order.
    fn routes(&mut self, name: &str) -> Result<Vec<RouteEntry>, NetError>;

    fn link_mac(&mut self, name: &str) -> Result<MacAddr, NetError>;

    fn set_mac(&mut self, name: &str, mac: MacAddr) -> Result<(), NetError>;

    fn delete_address(&mut self, name: &str, addr: Ipv4Network) -> Result<(), NetError>;

    fn create_tap(&mut self, name: &str) -> Result<(), NetError>;

    /// Create a bridge with MAC address aging disabled.
    fn create_bridge(&mut self, name: &str) -> Result<(), NetError>;

    fn set_master(&mut self, name: &str, master: &str) -> Result<(), NetError>;

    fn set_up(&mut self, name: &str) -> Result<(), NetError>;
}

/// Move every eligible container interface onto a bridge/TAP pair.
///
/// Interfaces that fail are logged and skipped; the call only fails when
/// nothing could be transited. On success the guest's NICs are replaced
/// with one entry per transit.
pub fn setup_interfaces<L: LinkOps>(
    links: &mut L,
    guest: &mut GuestSpec,
) -> Result<Vec<NetworkTransit>, NetError> {
    let mut transits = Vec::new();

    for iface in links.interfaces()? {
        if IGNORED_INTERFACES.contains(&iface.name.as_str()) {
            continue;
        }

        match transit_interface(links, &iface) {
            Ok(transit) => transits.push(transit),
            Err(e) => {
                tracing::error!(interface = %iface.name, error = %e, "transit of interface failed");
            }
        }
    }

    if transits.is_empty() {
        return Err(NetError::NoUsableInterfaces);
    }

    guest.nics = transits.iter().map(NetworkTransit::nic).collect();
    Ok(transits)
}

fn transit_interface<L: LinkOps>(
    links: &mut L,
    iface: &InterfaceInfo,
) -> Result<NetworkTransit, NetError> {
    let name = iface.name.as_str();
    let guest_net = *iface
        .addresses
        .first()
        .ok_or_else(|| NetError::NoAddress(name.to_string()))?;

    // Everything that can fail cheaply is checked before the address goes away.
    let routes = links.routes(name)?;
    let gateway = routes
        .iter()
        .find_map(|r| r.gateway)
        .ok_or_else(|| NetError::NoGateway(name.to_string()))?;

    links.delete_address(name, guest_net)?;

    tracing::info!(
        "Moving IP address {} ({}) with gateway {} from container to guest",
        guest_net.ip(),
        guest_net.mask(),
        gateway
    );

    let tap = format!("tap-{name}");
    let bridge = format!("br-{name}");
    let guest_mac = links.link_mac(name)?;
    let host_mac = fresh_mac(guest_mac);

    links.set_mac(name, host_mac)?;
    links.create_tap(&tap)?;
    links.set_mac(&tap, guest_mac)?;
    links.create_bridge(&bridge)?;

    for link in [tap.as_str(), name] {
        attach(links, &bridge, link)?;
    }
    for link in [tap.as_str(), name, bridge.as_str()] {
        links.set_up(link)?;
    }

    tracing::info!(
        interface = %name,
        bridge = %bridge,
        tap = %tap,
        guest_mac = %guest_mac,
        host_mac = %host_mac,
        "interface bridged"
    );

    Ok(NetworkTransit {
        interface: name.to_string(),
        guest_net,
        gateway,
        routes,
        bridge,
        tap,
        guest_mac,
        host_mac,
        dns_servers: Vec::new(),
        ntp_servers: Vec::new(),
        hostname: String::new(),
    })
}

fn fresh_mac(current: MacAddr) -> MacAddr {
    loop {
        let mac = MacAddr::random_local();
        if mac != current {
            return mac;
        }
    }
}

/// Enslave `link` to `bridge`, preserving both MAC addresses.
///
/// Assigning a bridge master can rewrite the link's and the bridge's
/// hardware address, so both are captured right before and written back
/// right after.
fn attach<L: LinkOps>(links: &mut L, bridge: &str, link: &str) -> Result<(), NetError> {
    let link_mac = links.link_mac(link)?;
    let bridge_mac = links.link_mac(bridge)?;

    links.set_master(link, bridge)?;

    links.set_mac(link, link_mac)?;
    links.set_mac(bridge, bridge_mac)?;
    Ok(())
}

/// [`LinkOps`] against the running kernel.
pub struct KernelLinks {
    netlink: NetlinkHandle,
    route_table: PathBuf,
}

impl KernelLinks {
    pub fn new() -> Result<Self, NetError> {
        Ok(Self {
            netlink: NetlinkHandle::new()?,
            route_table: PathBuf::from(PROC_NET_ROUTE),
        })
    }

    fn index(&self, name: &str) -> Result<u32, NetError> {
        nix::net::if_::if_nametoindex(name)
            .map_err(|_| NetError::InterfaceNotFound(name.to_string()))
    }
}

impl LinkOps for KernelLinks {
    fn interfaces(&mut self) -> Result<Vec<InterfaceInfo>, NetError> {
        let mut interfaces: Vec<InterfaceInfo> = Vec::new();

        for ifaddr in getifaddrs()? {
            let pos = match interfaces
                .iter()
                .position(|i| i.name == ifaddr.interface_name)
            {
                Some(pos) => pos,
                None => {
                    interfaces.push(InterfaceInfo {
                        name: ifaddr.interface_name.clone(),
                        addresses: Vec::new(),
                    });
                    interfaces.len() - 1
                }
            };

            let ip = ifaddr
                .address
                .as_ref()
                .and_then(|a| a.as_sockaddr_in())
                .map(|sin| *SocketAddrV4::from(*sin).ip());
            let mask = ifaddr
                .netmask
                .as_ref()
                .and_then(|a| a.as_sockaddr_in())
                .map(|sin| *SocketAddrV4::from(*sin).ip());

            if let Some(ip) = ip {
                let prefix = mask.map_or(32, |m| u32::from(m).count_ones() as u8);
                let net = Ipv4Network::new(ip, prefix)
                    .map_err(|e| NetError::Netlink(format!("{ip}/{prefix}: {e}")))?;
                interfaces[pos].addresses.push(net);
            }
        }

        Ok(interfaces)
    }

    fn routes(&mut self, name: &str) -> Result<Vec<RouteEntry>, NetError> {
        let content = std::fs::read_to_string(&self.route_table)?;
        parse_route_table(&content, name)
    }

    fn link_mac(&mut self, name: &str) -> Result<MacAddr, NetError> {
        getifaddrs()?
            .filter(|ifaddr| ifaddr.interface_name == name)
            .find_map(|ifaddr| {
                ifaddr
                    .address
                    .as_ref()
                    .and_then(|a| a.as_link_addr())
                    .and_then(|link| link.addr())
            })
            .map(MacAddr::from)
            .ok_or_else(|| NetError::InterfaceNotFound(name.to_string()))
    }

    fn set_mac(&mut self, name: &str, mac: MacAddr) -> Result<(), NetError> {
        let index = self.index(name)?;
        self.netlink.set_link_address(index, mac)
    }

    fn delete_address(&mut self, name: &str, addr: Ipv4Network) -> Result<(), NetError> {
        let index = self.index(name)?;
        self.netlink.delete_address(index, addr)
    }

    fn create_tap(&mut self, name: &str) -> Result<(), NetError> {
        tap::create_persistent_tap(name)
    }

    fn create_bridge(&mut self, name: &str) -> Result<(), NetError> {
        self.netlink.create_bridge(name)
    }

    fn set_master(&mut self, name: &str, master: &str) -> Result<(), NetError> {
        let index = self.index(name)?;
        let master = self.index(master)?;
        self.netlink.set_link_master(index, master)
    }

    fn set_up(&mut self, name: &str) -> Result<(), NetError> {
        let index = self.index(name)?;
        self.netlink.set_link_up(index)
    }
}

/// Parse `/proc/net/route` rows belonging to `iface`.
///
/// Addresses are printed as the raw in-memory value of a network-order
/// `u32`, so the native byte order recovers the octets.
pub fn parse_route_table(content: &str, iface: &str) -> Result<Vec<RouteEntry>, NetError> {
    let mut routes = Vec::new();

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 || fields[0] != iface {
            continue;
        }

        let destination = parse_hex_addr(fields[1])?;
        let gateway = parse_hex_addr(fields[2])?;
        let mask = parse_hex_addr(fields[7])?;
        let prefix = u32::from(mask).count_ones() as u8;

        let destination = if prefix == 0 {
            None
        } else {
            Some(
                Ipv4Network::new(destination, prefix)
                    .map_err(|e| NetError::InvalidRoute(format!("{line}: {e}")))?,
            )
        };
        let gateway = (!gateway.is_unspecified()).then_some(gateway);

        routes.push(RouteEntry::new(destination, gateway));
    }

    Ok(routes)
}

fn parse_hex_addr(field: &str) -> Result<Ipv4Addr, NetError> {
    let raw = u32::from_str_radix(field, 16)
        .map_err(|_| NetError::InvalidRoute(format!("bad address field {field:?}")))?;
    Ok(Ipv4Addr::from(raw.to_ne_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLinks;

    const ORIGINAL_MAC: MacAddr = MacAddr::new([0x02, 0x42, 0xc0, 0xa8, 0x01, 0x05]);

    fn container() -> FakeLinks {
        let mut links = FakeLinks::default();
        links.add_interface("lo", MacAddr::default(), &["127.0.0.1/8"]);
        links.add_interface("eth0", ORIGINAL_MAC, &["192.168.1.5/24"]);
        links.add_route("eth0", None, Some([192, 168, 1, 1]));
        links
    }

    #[test]
    fn test_transit_single_interface() {
        let mut links = container();
        let mut guest = GuestSpec::default();

        let transits = setup_interfaces(&mut links, &mut guest).unwrap();

        assert_eq!(transits.len(), 1);
        let transit = &transits[0];
        assert_eq!(transit.interface, "eth0");
        assert_eq!(transit.guest_net, "192.168.1.5/24".parse().unwrap());
        assert_eq!(transit.gateway, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(transit.bridge, "br-eth0");
        assert_eq!(transit.tap, "tap-eth0");
        assert_eq!(transit.guest_mac, ORIGINAL_MAC);
        assert_eq!(transit.routes.len(), 1);

        assert_eq!(guest.nics, vec![transit.nic()]);
    }

    #[test]
    fn test_transit_moves_address_and_macs() {
        let mut links = container();
        let transits = setup_interfaces(&mut links, &mut GuestSpec::default()).unwrap();
        let transit = &transits[0];

        let eth0 = links.link("eth0");
        assert!(eth0.addresses.is_empty());
        assert_ne!(eth0.mac, ORIGINAL_MAC);
        assert_eq!(eth0.mac, transit.host_mac);
        assert!(eth0.mac.is_locally_administered());
        assert!(eth0.mac.is_unicast());

        let tap = links.link("tap-eth0");
        assert_eq!(tap.mac, ORIGINAL_MAC);
    }

    #[test]
    fn test_transit_bridges_and_raises_links() {
        let mut links = container();
        setup_interfaces(&mut links, &mut GuestSpec::default()).unwrap();

        let bridge = links.link("br-eth0");
        assert!(bridge.is_bridge);
        assert!(bridge.ageing_disabled);
        assert!(bridge.up);

        for name in ["tap-eth0", "eth0"] {
            let link = links.link(name);
            assert_eq!(link.master.as_deref(), Some("br-eth0"));
            assert!(link.up);
        }

        assert!(!links.link("lo").up);
        assert!(links.link("lo").master.is_none());
    }

    #[test]
    fn test_bridge_attach_restores_clobbered_macs() {
        let mut links = container();
        links.clobber_mac_on_attach = true;

        let transits = setup_interfaces(&mut links, &mut GuestSpec::default()).unwrap();

        assert_eq!(links.link("tap-eth0").mac, ORIGINAL_MAC);
        assert_eq!(links.link("eth0").mac, transits[0].host_mac);
        assert_eq!(links.link("br-eth0").mac, links.initial_bridge_mac("br-eth0"));
    }

    #[test]
    fn test_interface_without_address_is_skipped() {
        let mut links = container();
        links.add_interface("eth1", MacAddr::new([0x02, 0, 0, 0, 0, 1]), &[]);

        let transits = setup_interfaces(&mut links, &mut GuestSpec::default()).unwrap();

        assert_eq!(transits.len(), 1);
        assert_eq!(transits[0].interface, "eth0");
        assert!(links.try_link("br-eth1").is_none());
    }

    #[test]
    fn test_interface_without_gateway_keeps_address() {
        let mut links = container();
        links.add_interface("eth1", MacAddr::new([0x02, 0, 0, 0, 0, 1]), &["10.0.0.2/24"]);
        links.add_route("eth1", Some("10.0.0.0/24"), None);

        let transits = setup_interfaces(&mut links, &mut GuestSpec::default()).unwrap();

        assert_eq!(transits.len(), 1);
        assert_eq!(links.link("eth1").addresses.len(), 1);
    }

    #[test]
    fn test_failing_bridge_skips_interface() {
        let mut links = container();
        links.add_interface("eth1", MacAddr::new([0x02, 0, 0, 0, 0, 1]), &["10.0.0.2/24"]);
        links.add_route("eth1", None, Some([10, 0, 0, 1]));
        links.fail_bridge = Some("br-eth0".to_string());

        let transits = setup_interfaces(&mut links, &mut GuestSpec::default()).unwrap();

        assert_eq!(transits.len(), 1);
        assert_eq!(transits[0].interface, "eth1");
    }

    #[test]
    fn test_no_usable_interfaces() {
        let mut links = FakeLinks::default();
        links.add_interface("lo", MacAddr::default(), &["127.0.0.1/8"]);
        links.add_interface("eth0", ORIGINAL_MAC, &[]);

        let mut guest = GuestSpec::default();
        let result = setup_interfaces(&mut links, &mut guest);

        assert!(matches!(result, Err(NetError::NoUsableInterfaces)));
        assert!(guest.nics.is_empty());
    }

    #[test]
    fn test_full_route_table_is_carried() {
        let mut links = container();
        links.add_route("eth0", Some("10.0.0.0/8"), Some([192, 168, 1, 254]));

        let transits = setup_interfaces(&mut links, &mut GuestSpec::default()).unwrap();

        assert_eq!(transits[0].routes.len(), 2);
        assert_eq!(transits[0].gateway, Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_parse_route_table() {
        let content = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0101A8C0\t0003\t0\t0\t0\t00000000\t0\t0\t0
eth0\t0001A8C0\t00000000\t0001\t0\t0\t0\t00FFFFFF\t0\t0\t0
eth1\t0000000A\t00000000\t0001\t0\t0\t0\t000000FF\t0\t0\t0
";
        let routes = parse_route_table(content, "eth0").unwrap();

        assert_eq!(
            routes,
            vec![
                RouteEntry::new(None, Some(Ipv4Addr::new(192, 168, 1, 1))),
                RouteEntry::new(Some("192.168.1.0/24".parse().unwrap()), None),
            ]
        );
    }

    #[test]
    fn test_parse_route_table_rejects_garbage() {
        let content = "Iface\tDestination\nfoo\tzz\tzz\t0\t0\t0\t0\tzz\n";
        assert!(parse_route_table(content, "foo").is_err());
    }
}
