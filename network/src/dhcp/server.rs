use super::packet::{
    DhcpOptions, DhcpPacket, MessageType, OPT_CLASSLESS_ROUTES, OPT_DNS_SERVERS, OPT_HOSTNAME,
    OPT_NTP_SERVERS, OPT_ROUTER, OPT_SUBNET_MASK, ReplyParams, build_reply,
};
use crate::error::NetError;
use crate::routes::{encode_classless_routes, has_classless_routes};
use cvmm_core::NetworkTransit;
use nix::sys::socket::{
    AddressFamily, SockFlag, SockType, SockaddrIn, bind, setsockopt, socket, sockopt,
};
use std::ffi::OsString;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use tokio::net::UdpSocket;

pub const SERVER_PORT: u16 = 67;
pub const INFINITE_LEASE: u32 = u32::MAX;

const RECV_BUFFER: usize = 1500;

/// Answers the guest NIC behind one bridge.
#[derive(Debug, Clone)]
pub struct DhcpServer {
    transit: NetworkTransit,
    options: DhcpOptions,
}

impl DhcpServer {
    pub fn new(transit: NetworkTransit) -> Self {
        let options = lease_options(&transit);
        Self { transit, options }
    }

    pub fn transit(&self) -> &NetworkTransit {
        &self.transit
    }

    pub fn bridge(&self) -> &str {
        &self.transit.bridge
    }

    /// Compute the reply to one client datagram.
    pub fn handle(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let request = DhcpPacket::parse(raw)?;
        let message_type = request.message_type()?;
        tracing::debug!(bridge = %self.transit.bridge, ?message_type, "DHCP request");

        let reply_type = match message_type {
            MessageType::Discover => MessageType::Offer,
            MessageType::Request => MessageType::Ack,
            _ => return None,
        };

        let client = request.client_mac();
        if client != self.transit.guest_mac {
            tracing::debug!(
                bridge = %self.transit.bridge,
                %client,
                expected = %self.transit.guest_mac,
                "ignoring DHCP request from unknown client"
            );
            return None;
        }

        let params = ReplyParams {
            message_type: reply_type,
            server_id: self.transit.gateway,
            your_ip: self.transit.guest_ip(),
            lease_secs: INFINITE_LEASE,
        };
        let options = self
            .options
            .select_order_or_all(request.requested_parameters());

        tracing::info!(
            bridge = %self.transit.bridge,
            response = ?reply_type,
            ip = %self.transit.guest_ip(),
            "DHCP response"
        );
        Some(build_reply(&request, params, &options))
    }

    /// Open the server socket on the bridge.
    pub fn bind(&self) -> Result<UdpSocket, NetError> {
        let dhcp_err = |reason: String| NetError::Dhcp {
            bridge: self.transit.bridge.clone(),
            reason,
        };

        let fd = socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(|e| dhcp_err(format!("socket: {e}")))?;

        setsockopt(&fd, sockopt::ReuseAddr, &true)
            .map_err(|e| dhcp_err(format!("SO_REUSEADDR: {e}")))?;
        setsockopt(&fd, sockopt::Broadcast, &true)
            .map_err(|e| dhcp_err(format!("SO_BROADCAST: {e}")))?;
        setsockopt(
            &fd,
            sockopt::BindToDevice,
            &OsString::from(&self.transit.bridge),
        )
        .map_err(|e| dhcp_err(format!("SO_BINDTODEVICE: {e}")))?;

        let addr = SockaddrIn::new(0, 0, 0, 0, SERVER_PORT);
        bind(fd.as_raw_fd(), &addr).map_err(|e| dhcp_err(format!("bind {addr}: {e}")))?;

        let socket = std::net::UdpSocket::from(fd);
        Ok(UdpSocket::from_std(socket)?)
    }

    /// Receive loop; returns only when the socket fails.
    pub async fn serve(&self, socket: UdpSocket) -> Result<(), NetError> {
        let mut buf = vec![0u8; RECV_BUFFER];

        loop {
            let (len, src) = socket.recv_from(&mut buf).await?;
            let Some(reply) = self.handle(&buf[..len]) else {
                continue;
            };

            let dst = reply_destination(src, &reply);
            if let Err(e) = socket.send_to(&reply, dst).await {
                tracing::warn!(bridge = %self.transit.bridge, %dst, "failed to send DHCP reply: {e}");
            }
        }
    }

    pub async fn run(self) -> Result<(), NetError> {
        let socket = self.bind()?;
        tracing::info!(
            bridge = %self.transit.bridge,
            client = %self.transit.guest_mac,
            ip = %self.transit.guest_ip(),
            "DHCP server listening"
        );
        self.serve(socket).await
    }
}

fn lease_options(transit: &NetworkTransit) -> DhcpOptions {
    let mut options = DhcpOptions::new();

    options.insert(OPT_SUBNET_MASK, transit.guest_net.mask().octets());
    options.insert(OPT_ROUTER, transit.gateway.octets());
    if !transit.dns_servers.is_empty() {
        options.insert(OPT_DNS_SERVERS, flatten(&transit.dns_servers));
    }
    if !transit.hostname.is_empty() {
        options.insert(OPT_HOSTNAME, transit.hostname.as_bytes().to_vec());
    }
    if !transit.ntp_servers.is_empty() {
        options.insert(OPT_NTP_SERVERS, flatten(&transit.ntp_servers));
    }
    if has_classless_routes(&transit.routes) {
        options.insert(OPT_CLASSLESS_ROUTES, encode_classless_routes(&transit.routes));
    }

    options
}

fn flatten(addrs: &[Ipv4Addr]) -> Vec<u8> {
    addrs.iter().flat_map(|a| a.octets()).collect()
}

/// Clients without an address yet, or asking for it, get a broadcast.
fn reply_destination(src: SocketAddr, reply: &[u8]) -> SocketAddr {
    let broadcast_flag = reply[10] & 0x80 != 0;
    if broadcast_flag || src.ip().is_unspecified() {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, src.port()))
    } else {
        src
    }
}
