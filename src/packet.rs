// Link-layer header decoders.
//
// Turns raw frame bytes into typed Ethernet, IPv4, TCP and UDP header records.
// Every decoder checks the length of its byte window before touching it and
// reports `DecodeError::Truncated` instead of reading past the end; captured
// frames are untrusted input.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Serialize, Serializer};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

// Ethernet
pub const ETH_HLEN: usize = 14;
pub const ETHERTYPE_IPV4: u16 = 0x0800;

// IPv4
pub const IPV4_MIN_HLEN: usize = 20;
const IPV4_TOTAL_LEN_OFFSET: usize = 2;
const IPV4_ID_OFFSET: usize = 4;
const IPV4_FLAGS_FRAG_OFFSET: usize = 6;
const IPV4_TTL_OFFSET: usize = 8;
const IPV4_PROTO_OFFSET: usize = 9;
const IPV4_CHECKSUM_OFFSET: usize = 10;
const IPV4_SRC_OFFSET: usize = 12;
const IPV4_DST_OFFSET: usize = 16;

// L4
pub const TCP_MIN_HLEN: usize = 20;
pub const UDP_HLEN: usize = 8;

// IP protocol numbers
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Protocol layer a decode error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Ethernet,
    Ipv4,
    Tcp,
    Udp,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Layer::Ethernet => "ethernet",
            Layer::Ipv4 => "ipv4",
            Layer::Tcp => "tcp",
            Layer::Udp => "udp",
        };
        f.write_str(name)
    }
}

/// A frame could not be decoded. Always local to one frame, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("{layer} header truncated: need {needed} bytes, have {available}")]
    Truncated {
        layer: Layer,
        needed: usize,
        available: usize,
    },
    #[error("ipv4 header length {0} bytes is below the 20-byte minimum")]
    BadHeaderLength(usize),
}

fn require(layer: Layer, data: &[u8], needed: usize) -> Result<(), DecodeError> {
    if data.len() < needed {
        return Err(DecodeError::Truncated {
            layer,
            needed,
            available: data.len(),
        });
    }
    Ok(())
}

#[inline]
fn be16(data: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([data[off], data[off + 1]])
}

#[inline]
fn be32(data: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

#[inline]
fn ipv4_at(data: &[u8], off: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[off], data[off + 1], data[off + 2], data[off + 3])
}

// ---------------------------------------------------------------------------
// Header records
// ---------------------------------------------------------------------------

/// 48-bit hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EthernetHeader {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    pub ether_type: u16,
}

impl EthernetHeader {
    pub fn is_ipv4(&self) -> bool {
        self.ether_type == ETHERTYPE_IPV4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ipv4Header {
    pub version_ihl: u8,
    pub dscp: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    pub fn version(&self) -> u8 {
        self.version_ihl >> 4
    }

    /// Header length in bytes, from the IHL nibble (32-bit words).
    pub fn header_len(&self) -> usize {
        ((self.version_ihl & 0x0F) as usize) * 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_offset_reserved: u8,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    /// TCP header length in bytes, options included.
    pub fn header_len(&self) -> usize {
        ((self.data_offset_reserved >> 4) as usize) * 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum TransportHeader {
    Tcp(TcpHeader),
    Udp(UdpHeader),
}

impl TransportHeader {
    pub fn src_port(&self) -> u16 {
        match self {
            TransportHeader::Tcp(h) => h.src_port,
            TransportHeader::Udp(h) => h.src_port,
        }
    }

    pub fn dst_port(&self) -> u16 {
        match self {
            TransportHeader::Tcp(h) => h.dst_port,
            TransportHeader::Udp(h) => h.dst_port,
        }
    }
}

/// The full header chain of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DecodedFrame {
    pub ethernet: EthernetHeader,
    pub ipv4: Option<Ipv4Header>,
    pub transport: Option<TransportHeader>,
}

// ---------------------------------------------------------------------------
// Single-header decoders
// ---------------------------------------------------------------------------

pub fn decode_ethernet(data: &[u8]) -> Result<EthernetHeader, DecodeError> {
    require(Layer::Ethernet, data, ETH_HLEN)?;
    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&data[0..6]);
    src.copy_from_slice(&data[6..12]);
    Ok(EthernetHeader {
        dst_mac: MacAddr(dst),
        src_mac: MacAddr(src),
        ether_type: be16(data, 12),
    })
}

/// Decode the fixed 20-byte part of an IPv4 header. Options are not decoded.
pub fn decode_ipv4(data: &[u8]) -> Result<Ipv4Header, DecodeError> {
    require(Layer::Ipv4, data, IPV4_MIN_HLEN)?;
    Ok(Ipv4Header {
        version_ihl: data[0],
        dscp: data[1],
        total_length: be16(data, IPV4_TOTAL_LEN_OFFSET),
        identification: be16(data, IPV4_ID_OFFSET),
        flags_fragment: be16(data, IPV4_FLAGS_FRAG_OFFSET),
        ttl: data[IPV4_TTL_OFFSET],
        protocol: data[IPV4_PROTO_OFFSET],
        checksum: be16(data, IPV4_CHECKSUM_OFFSET),
        src: ipv4_at(data, IPV4_SRC_OFFSET),
        dst: ipv4_at(data, IPV4_DST_OFFSET),
    })
}

pub fn decode_tcp(data: &[u8]) -> Result<TcpHeader, DecodeError> {
    require(Layer::Tcp, data, TCP_MIN_HLEN)?;
    Ok(TcpHeader {
        src_port: be16(data, 0),
        dst_port: be16(data, 2),
        seq: be32(data, 4),
        ack: be32(data, 8),
        data_offset_reserved: data[12],
        flags: data[13],
        window: be16(data, 14),
        checksum: be16(data, 16),
        urgent_ptr: be16(data, 18),
    })
}

pub fn decode_udp(data: &[u8]) -> Result<UdpHeader, DecodeError> {
    require(Layer::Udp, data, UDP_HLEN)?;
    Ok(UdpHeader {
        src_port: be16(data, 0),
        dst_port: be16(data, 2),
        length: be16(data, 4),
        checksum: be16(data, 6),
    })
}

// ---------------------------------------------------------------------------
// Frame-level decoding
// ---------------------------------------------------------------------------

/// Offset of the transport header within an Ethernet frame.
///
/// Derived from the IHL field; an IHL under five words is rejected because it
/// would overlap the fixed IPv4 header.
pub fn transport_offset(ip: &Ipv4Header) -> Result<usize, DecodeError> {
    let ihl = ip.header_len();
    if ihl < IPV4_MIN_HLEN {
        return Err(DecodeError::BadHeaderLength(ihl));
    }
    Ok(ETH_HLEN + ihl)
}

/// Decode the Ethernet header and, for IPv4 frames, the IPv4 header.
///
/// Returns `None` for the IPv4 part when the frame carries another ether-type.
/// The IHL is validated for every protocol: it must be at least five words and
/// the frame must hold the whole header it claims, options included.
pub fn decode_network(frame: &[u8]) -> Result<(EthernetHeader, Option<Ipv4Header>), DecodeError> {
    let ethernet = decode_ethernet(frame)?;
    if !ethernet.is_ipv4() {
        return Ok((ethernet, None));
    }
    let ipv4 = decode_ipv4(&frame[ETH_HLEN..])?;
    let header_end = transport_offset(&ipv4)?;
    if frame.len() < header_end {
        return Err(DecodeError::Truncated {
            layer: Layer::Ipv4,
            needed: header_end,
            available: frame.len(),
        });
    }
    Ok((ethernet, Some(ipv4)))
}

/// Decode the TCP or UDP header following `ip`, if the protocol is one of them.
pub fn decode_transport(
    frame: &[u8],
    ip: &Ipv4Header,
) -> Result<Option<TransportHeader>, DecodeError> {
    let layer = match ip.protocol {
        PROTO_TCP => Layer::Tcp,
        PROTO_UDP => Layer::Udp,
        _ => return Ok(None),
    };
    let offset = transport_offset(ip)?;
    let needed = match layer {
        Layer::Tcp => TCP_MIN_HLEN,
        _ => UDP_HLEN,
    };
    if frame.len() < offset + needed {
        return Err(DecodeError::Truncated {
            layer,
            needed: offset + needed,
            available: frame.len(),
        });
    }
    let l4 = &frame[offset..];
    let header = match layer {
        Layer::Tcp => TransportHeader::Tcp(decode_tcp(l4)?),
        _ => TransportHeader::Udp(decode_udp(l4)?),
    };
    Ok(Some(header))
}

/// Decode every applicable layer of an Ethernet frame.
pub fn decode_frame(frame: &[u8]) -> Result<DecodedFrame, DecodeError> {
    let (ethernet, ipv4) = decode_network(frame)?;
    let transport = match &ipv4 {
        Some(ip) => decode_transport(frame, ip)?,
        None => None,
    };
    Ok(DecodedFrame {
        ethernet,
        ipv4,
        transport,
    })
}

/// Human-readable name for an IP protocol number.
pub fn protocol_name(proto: u8) -> Option<&'static str> {
    match proto {
        PROTO_ICMP => Some("icmp"),
        2 => Some("igmp"),
        PROTO_TCP => Some("tcp"),
        PROTO_UDP => Some("udp"),
        47 => Some("gre"),
        50 => Some("esp"),
        51 => Some("ah"),
        89 => Some("ospf"),
        132 => Some("sctp"),
        _ => None,
    }
}

// ===========================================================================
// Unit tests
// ===========================================================================
