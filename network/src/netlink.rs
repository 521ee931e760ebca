//! Minimal rtnetlink client for the link and address changes the transit
//! needs: bridge creation, master assignment, MAC changes, link state and
//! address removal.

use crate::error::NetError;
use cvmm_core::MacAddr;
use ipnetwork::Ipv4Network;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

const NETLINK_ROUTE: i32 = 0;

const RTM_NEWLINK: u16 = 16;
const RTM_DELADDR: u16 = 21;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;

const NLA_F_NESTED: u16 = 1 << 15;

const IFF_UP: u32 = 0x1;

const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_MASTER: u16 = 10;
const IFLA_LINKINFO: u16 = 18;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const IFLA_BR_AGEING_TIME: u16 = 4;

const IFA_LOCAL: u16 = 2;

const NLMSG_HDR_LEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;
const IFADDRMSG_LEN: usize = 8;

/// Request under construction: header placeholder, family message, attributes.
struct Request {
    buf: Vec<u8>,
    msg_type: u16,
    flags: u16,
}

impl Request {
    fn new(msg_type: u16, flags: u16) -> Self {
        Self {
            buf: vec![0u8; NLMSG_HDR_LEN],
            msg_type,
            flags: flags | NLM_F_REQUEST | NLM_F_ACK,
        }
    }

    /// Append an `ifinfomsg`.
    fn link(mut self, index: u32, flags: u32, change: u32) -> Self {
        self.buf.push(libc::AF_UNSPEC as u8);
        self.buf.push(0);
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(index as i32).to_ne_bytes());
        self.buf.extend_from_slice(&flags.to_ne_bytes());
        self.buf.extend_from_slice(&change.to_ne_bytes());
        debug_assert_eq!(self.buf.len(), NLMSG_HDR_LEN + IFINFOMSG_LEN);
        self
    }

    /// Append an `ifaddrmsg` for an IPv4 address.
    fn address(mut self, index: u32, prefix: u8) -> Self {
        self.buf.push(libc::AF_INET as u8);
        self.buf.push(prefix);
        self.buf.push(0);
        self.buf.push(0);
        self.buf.extend_from_slice(&index.to_ne_bytes());
        debug_assert_eq!(self.buf.len(), NLMSG_HDR_LEN + IFADDRMSG_LEN);
        self
    }

    fn attr(&mut self, attr_type: u16, value: &[u8]) {
        let len = 4 + value.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        self.buf.extend_from_slice(value);
        self.pad();
    }

    fn attr_str(&mut self, attr_type: u16, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.attr(attr_type, &bytes);
    }

    fn attr_u32(&mut self, attr_type: u16, value: u32) {
        self.attr(attr_type, &value.to_ne_bytes());
    }

    /// Open a nested attribute; returns its offset for `end_nested`.
    fn begin_nested(&mut self, attr_type: u16) -> usize {
        let start = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(attr_type | NLA_F_NESTED).to_ne_bytes());
        start
    }

    fn end_nested(&mut self, start: usize) {
        let len = (self.buf.len() - start) as u16;
        self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
    }

    fn pad(&mut self) {
        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    fn finish(mut self, seq: u32) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf[4..6].copy_from_slice(&self.msg_type.to_ne_bytes());
        self.buf[6..8].copy_from_slice(&self.flags.to_ne_bytes());
        self.buf[8..12].copy_from_slice(&seq.to_ne_bytes());
        self.buf[12..16].copy_from_slice(&0u32.to_ne_bytes());
        self.buf
    }
}

/// Netlink route socket.
pub struct NetlinkHandle {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkHandle {
    pub fn new() -> Result<Self, NetError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(NetError::Netlink(format!(
                "failed to create netlink socket: {}",
                io::Error::last_os_error()
            )));
        }
        // Owned from here on so every error path closes it.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;

        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if ret < 0 {
            return Err(NetError::Netlink(format!(
                "failed to bind netlink socket: {}",
                io::Error::last_os_error()
            )));
        }

        Ok(Self { fd, seq: 0 })
    }

    fn execute(&mut self, request: Request, what: &str) -> Result<(), NetError> {
        self.seq = self.seq.wrapping_add(1);
        let msg = request.finish(self.seq);

        let sent = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if sent < 0 {
            return Err(NetError::Netlink(format!(
                "{what}: send failed: {}",
                io::Error::last_os_error()
            )));
        }

        let mut buf = [0u8; 4096];
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if len < 0 {
            return Err(NetError::Netlink(format!(
                "{what}: receive failed: {}",
                io::Error::last_os_error()
            )));
        }

        match ack_error(&buf[..len as usize]) {
            Some(errno) => Err(NetError::Netlink(format!(
                "{what}: {}",
                io::Error::from_raw_os_error(errno)
            ))),
            None => Ok(()),
        }
    }

    /// Create a bridge with forwarding-table aging disabled.
    pub fn create_bridge(&mut self, name: &str) -> Result<(), NetError> {
        let mut req = Request::new(RTM_NEWLINK, NLM_F_CREATE | NLM_F_EXCL).link(0, 0, 0);
        req.attr_str(IFLA_IFNAME, name);
        let linkinfo = req.begin_nested(IFLA_LINKINFO);
        req.attr_str(IFLA_INFO_KIND, "bridge");
        let data = req.begin_nested(IFLA_INFO_DATA);
        req.attr_u32(IFLA_BR_AGEING_TIME, 0);
        req.end_nested(data);
        req.end_nested(linkinfo);

        self.execute(req, &format!("create bridge {name}"))
    }

    pub fn set_link_up(&mut self, index: u32) -> Result<(), NetError> {
        let req = Request::new(RTM_NEWLINK, 0).link(index, IFF_UP, IFF_UP);
        self.execute(req, &format!("set link {index} up"))
    }

    pub fn set_link_master(&mut self, index: u32, master: u32) -> Result<(), NetError> {
        let mut req = Request::new(RTM_NEWLINK, 0).link(index, 0, 0);
        req.attr_u32(IFLA_MASTER, master);
        self.execute(req, &format!("set master of link {index} to {master}"))
    }

    pub fn set_link_address(&mut self, index: u32, mac: MacAddr) -> Result<(), NetError> {
        let mut req = Request::new(RTM_NEWLINK, 0).link(index, 0, 0);
        req.attr(IFLA_ADDRESS, &mac.octets());
        self.execute(req, &format!("set address {mac} on link {index}"))
    }

    pub fn delete_address(&mut self, index: u32, addr: Ipv4Network) -> Result<(), NetError> {
        let mut req = Request::new(RTM_DELADDR, 0).address(index, addr.prefix());
        req.attr(IFA_LOCAL, &addr.ip().octets());
        self.execute(req, &format!("delete address {addr} from link {index}"))
    }
}

/// Extract the errno from an `NLMSG_ERROR` reply; `None` for a plain ack.
fn ack_error(reply: &[u8]) -> Option<i32> {
    if reply.len() < NLMSG_HDR_LEN + 4 {
        return None;
    }
    let msg_type = u16::from_ne_bytes([reply[4], reply[5]]);
    if msg_type != libc::NLMSG_ERROR as u16 {
        return None;
    }
    let code = i32::from_ne_bytes([
        reply[NLMSG_HDR_LEN],
        reply[NLMSG_HDR_LEN + 1],
        reply[NLMSG_HDR_LEN + 2],
        reply[NLMSG_HDR_LEN + 3],
    ]);
    (code != 0).then_some(-code)
}
