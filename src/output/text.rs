use std::fmt::Write as _;
use std::io::Write;

use crate::error::SniffError;
use crate::packet::{self, DecodedFrame, TcpHeader, TransportHeader};

use super::{MatchedFrame, Reporter};

/// One human-readable line per frame:
///
/// ```text
/// #1 1700000000.000123 10.0.0.5:443 -> 10.0.0.9:51000 TCP [SYN,ACK] len=54
/// ```
pub struct TextReporter<W: Write> {
    writer: W,
}

impl<W: Write> TextReporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Reporter for TextReporter<W> {
    fn report(&mut self, frame: &MatchedFrame<'_>) -> Result<(), SniffError> {
        writeln!(self.writer, "{}", format_line(frame)).map_err(SniffError::Output)
    }

    fn flush(&mut self) -> Result<(), SniffError> {
        self.writer.flush().map_err(SniffError::Output)
    }
}

pub fn format_line(frame: &MatchedFrame<'_>) -> String {
    let mut line = format!("#{}", frame.seq);
    if let Some(ts) = frame.timestamp_us {
        let _ = write!(line, " {}.{:06}", ts / 1_000_000, ts % 1_000_000);
    }
    line.push(' ');
    describe_headers(&mut line, &frame.headers);
    let _ = write!(line, " len={}", frame.raw.len());
    line
}

fn describe_headers(out: &mut String, headers: &DecodedFrame) {
    let Some(ip) = &headers.ipv4 else {
        let eth = &headers.ethernet;
        let _ = write!(
            out,
            "{} -> {} ethertype=0x{:04x}",
            eth.src_mac, eth.dst_mac, eth.ether_type
        );
        return;
    };

    match &headers.transport {
        Some(l4) => {
            let _ = write!(
                out,
                "{}:{} -> {}:{}",
                ip.src,
                l4.src_port(),
                ip.dst,
                l4.dst_port()
            );
        }
        None => {
            let _ = write!(out, "{} -> {}", ip.src, ip.dst);
        }
    }

    match packet::protocol_name(ip.protocol) {
        Some(name) => {
            out.push(' ');
            out.push_str(&name.to_ascii_uppercase());
        }
        None => {
            let _ = write!(out, " proto={}", ip.protocol);
        }
    }

    if let Some(TransportHeader::Tcp(tcp)) = &headers.transport {
        let _ = write!(out, " [{}]", tcp_flags(tcp.flags));
    }
}

fn tcp_flags(flags: u8) -> String {
    const NAMES: [(u8, &str); 6] = [
        (TcpHeader::FIN, "FIN"),
        (TcpHeader::SYN, "SYN"),
        (TcpHeader::RST, "RST"),
        (TcpHeader::PSH, "PSH"),
        (TcpHeader::ACK, "ACK"),
        (TcpHeader::URG, "URG"),
    ];
    let set: Vec<&str> = NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if set.is_empty() {
        "-".to_string()
    } else {
        set.join(",")
    }
}
