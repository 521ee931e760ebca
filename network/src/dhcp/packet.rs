//! BOOTP/DHCP message parsing and reply construction.

use cvmm_core::MacAddr;
use std::net::Ipv4Addr;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
const HTYPE_ETHERNET: u8 = 1;

pub const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const OPTIONS_OFFSET: usize = 240;
/// Classic BOOTP minimum; some clients drop anything shorter.
const MIN_PACKET_LEN: usize = 300;
const BROADCAST_FLAG: u16 = 0x8000;

pub const OPT_PAD: u8 = 0;
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_DNS_SERVERS: u8 = 6;
pub const OPT_HOSTNAME: u8 = 12;
pub const OPT_NTP_SERVERS: u8 = 42;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAMETER_REQUEST_LIST: u8 = 55;
pub const OPT_CLASSLESS_ROUTES: u8 = 121;
pub const OPT_END: u8 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::Offer => 2,
            Self::Request => 3,
            Self::Decline => 4,
            Self::Ack => 5,
            Self::Nak => 6,
            Self::Release => 7,
            Self::Inform => 8,
        }
    }
}

/// A validated BOOTREQUEST borrowed from the receive buffer.
#[derive(Debug)]
pub struct DhcpPacket<'a> {
    raw: &'a [u8],
    options: Vec<(u8, &'a [u8])>,
}

impl<'a> DhcpPacket<'a> {
    /// Parse a client request; anything that is not a well-formed DHCP
    /// BOOTREQUEST yields `None`.
    pub fn parse(raw: &'a [u8]) -> Option<Self> {
        if raw.len() < OPTIONS_OFFSET || raw[0] != BOOTREQUEST || raw[2] > 16 {
            return None;
        }
        if raw[236..OPTIONS_OFFSET] != MAGIC_COOKIE {
            return None;
        }

        let options = parse_options(&raw[OPTIONS_OFFSET..])?;
        let packet = Self { raw, options };
        packet.message_type()?;
        Some(packet)
    }

    pub fn xid(&self) -> &'a [u8] {
        &self.raw[4..8]
    }

    pub fn flags(&self) -> u16 {
        u16::from_be_bytes([self.raw[10], self.raw[11]])
    }

    pub fn broadcast(&self) -> bool {
        self.flags() & BROADCAST_FLAG != 0
    }

    pub fn giaddr(&self) -> &'a [u8] {
        &self.raw[24..28]
    }

    /// Raw 16-byte client hardware address field.
    pub fn chaddr_field(&self) -> &'a [u8] {
        &self.raw[28..44]
    }

    pub fn client_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.raw[28..34]);
        MacAddr::new(mac)
    }

    /// Value of the first instance of `code`.
    pub fn option(&self, code: u8) -> Option<&'a [u8]> {
        self.options
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, value)| *value)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.option(OPT_MESSAGE_TYPE)
            .and_then(|v| v.first())
            .and_then(|&t| MessageType::from_u8(t))
    }

    pub fn requested_parameters(&self) -> &'a [u8] {
        self.option(OPT_PARAMETER_REQUEST_LIST).unwrap_or(&[])
    }
}

fn parse_options(mut data: &[u8]) -> Option<Vec<(u8, &[u8])>> {
    let mut options = Vec::new();

    while let Some((&code, rest)) = data.split_first() {
        match code {
            OPT_END => break,
            OPT_PAD => data = rest,
            _ => {
                let (&len, rest) = rest.split_first()?;
                let len = usize::from(len);
                if rest.len() < len {
                    return None;
                }
                options.push((code, &rest[..len]));
                data = &rest[len..];
            }
        }
    }

    Some(options)
}

/// Reply options keyed by code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhcpOptions(Vec<(u8, Vec<u8>)>);

impl DhcpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: u8, value: impl Into<Vec<u8>>) {
        let value = value.into();
        match self.0.iter_mut().find(|(c, _)| *c == code) {
            Some(entry) => entry.1 = value,
            None => self.0.push((code, value)),
        }
    }

    pub fn get(&self, code: u8) -> Option<&[u8]> {
        self.0
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_slice())
    }

    pub fn contains(&self, code: u8) -> bool {
        self.get(code).is_some()
    }

    /// Options in the client's requested order, followed by everything
    /// it did not ask for in ascending code order.
    pub fn select_order_or_all(&self, requested: &[u8]) -> Vec<(u8, &[u8])> {
        let mut selected: Vec<(u8, &[u8])> = Vec::with_capacity(self.0.len());

        for &code in requested {
            if selected.iter().any(|(c, _)| *c == code) {
                continue;
            }
            if let Some(value) = self.get(code) {
                selected.push((code, value));
            }
        }

        let mut rest: Vec<(u8, &[u8])> = self
            .0
            .iter()
            .filter(|(code, _)| !requested.contains(code))
            .map(|(code, value)| (*code, value.as_slice()))
            .collect();
        rest.sort_by_key(|(code, _)| *code);

        selected.extend(rest);
        selected
    }
}

/// Fields of a reply that are not copied from the request.
#[derive(Debug, Clone, Copy)]
pub struct ReplyParams {
    pub message_type: MessageType,
    pub server_id: Ipv4Addr,
    pub your_ip: Ipv4Addr,
    pub lease_secs: u32,
}

/// Build a BOOTREPLY answering `request`.
pub fn build_reply(request: &DhcpPacket<'_>, params: ReplyParams, options: &[(u8, &[u8])]) -> Vec<u8> {
    let mut reply = vec![0u8; OPTIONS_OFFSET];

    reply[0] = BOOTREPLY;
    reply[1] = HTYPE_ETHERNET;
    reply[2] = 6;
    reply[4..8].copy_from_slice(request.xid());
    reply[10..12].copy_from_slice(&request.flags().to_be_bytes());
    reply[16..20].copy_from_slice(&params.your_ip.octets());
    reply[20..24].copy_from_slice(&params.server_id.octets());
    reply[24..28].copy_from_slice(request.giaddr());
    reply[28..44].copy_from_slice(request.chaddr_field());
    reply[236..240].copy_from_slice(&MAGIC_COOKIE);

    push_option(&mut reply, OPT_MESSAGE_TYPE, &[params.message_type.as_u8()]);
    push_option(&mut reply, OPT_SERVER_ID, &params.server_id.octets());
    push_option(&mut reply, OPT_LEASE_TIME, &params.lease_secs.to_be_bytes());
    for (code, value) in options {
        push_option(&mut reply, *code, value);
    }
    reply.push(OPT_END);

    if reply.len() < MIN_PACKET_LEN {
        reply.resize(MIN_PACKET_LEN, OPT_PAD);
    }
    reply
}

/// Append an option, splitting values over 255 bytes into consecutive
/// instances of the same code (RFC 3396).
fn push_option(buf: &mut Vec<u8>, code: u8, value: &[u8]) {
    if value.is_empty() {
        buf.extend_from_slice(&[code, 0]);
        return;
    }
    for chunk in value.chunks(255) {
        buf.push(code);
        buf.push(chunk.len() as u8);
        buf.extend_from_slice(chunk);
    }
}
