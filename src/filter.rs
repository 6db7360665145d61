//! Software packet filter.
//!
//! A frame is tested against five independent match sets in a fixed order:
//! protocol, source address, destination address, then source and destination
//! port for TCP and UDP frames. An empty set places no constraint on its
//! dimension. Evaluation stops at the first dimension that fails.

use std::net::Ipv4Addr;

use rustc_hash::FxHashSet;

use crate::packet::{self, DecodeError, Ipv4Header, PROTO_TCP, PROTO_UDP};

/// Match sets for one capture run. Immutable once the run starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterCriteria {
    pub protocols: FxHashSet<u8>,
    pub src_ips: FxHashSet<Ipv4Addr>,
    pub dst_ips: FxHashSet<Ipv4Addr>,
    pub src_ports: FxHashSet<u16>,
    pub dst_ports: FxHashSet<u16>,
}

impl FilterCriteria {
    /// Criteria that accept every frame.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn with_protocols(mut self, protocols: impl IntoIterator<Item = u8>) -> Self {
        self.protocols.extend(protocols);
        self
    }

    pub fn with_src_ips(mut self, ips: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        self.src_ips.extend(ips);
        self
    }

    pub fn with_dst_ips(mut self, ips: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        self.dst_ips.extend(ips);
        self
    }

    pub fn with_src_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.src_ports.extend(ports);
        self
    }

    pub fn with_dst_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.dst_ports.extend(ports);
        self
    }

    /// True when no dimension is constrained.
    pub fn is_open(&self) -> bool {
        self.protocols.is_empty()
            && self.src_ips.is_empty()
            && self.dst_ips.is_empty()
            && self.src_ports.is_empty()
            && self.dst_ports.is_empty()
    }

    fn has_port_constraint(&self) -> bool {
        !self.src_ports.is_empty() || !self.dst_ports.is_empty()
    }
}

/// Membership test of a set; an empty set admits everything.
#[inline]
fn admits<T: Eq + std::hash::Hash>(set: &FxHashSet<T>, value: &T) -> bool {
    set.is_empty() || set.contains(value)
}

/// Evaluates frames against a fixed [`FilterCriteria`].
#[derive(Debug, Clone, Default)]
pub struct PacketFilter {
    criteria: FilterCriteria,
}

impl PacketFilter {
    pub fn new(criteria: FilterCriteria) -> Self {
        Self { criteria }
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    /// Decide whether `frame` matches.
    ///
    /// `Err` means the frame could not be decoded far enough to evaluate the
    /// criteria; `Ok(false)` means it decoded and was filtered out. Frames that
    /// do not carry IPv4 only match an open filter.
    pub fn matches(&self, frame: &[u8]) -> Result<bool, DecodeError> {
        let (_, ipv4) = packet::decode_network(frame)?;
        let Some(ip) = ipv4 else {
            return Ok(self.criteria.is_open());
        };
        self.matches_ipv4(frame, &ip)
    }

    fn matches_ipv4(&self, frame: &[u8], ip: &Ipv4Header) -> Result<bool, DecodeError> {
        let c = &self.criteria;
        if !admits(&c.protocols, &ip.protocol) {
            return Ok(false);
        }
        if !admits(&c.src_ips, &ip.src) {
            return Ok(false);
        }
        if !admits(&c.dst_ips, &ip.dst) {
            return Ok(false);
        }
        if !matches!(ip.protocol, PROTO_TCP | PROTO_UDP) || !c.has_port_constraint() {
            return Ok(true);
        }

        // Ports sit at the same offsets in TCP and UDP headers.
        let Some(l4) = packet::decode_transport(frame, ip)? else {
            return Ok(true);
        };
        Ok(admits(&c.src_ports, &l4.src_port()) && admits(&c.dst_ports, &l4.dst_port()))
    }
}
