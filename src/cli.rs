use std::net::Ipv4Addr;
use std::time::Duration;

use clap::Parser;

use crate::capture::{CaptureConfig, DEFAULT_BUFFER_SIZE};
use crate::filter::FilterCriteria;
use crate::output::OutputFormat;
use crate::packet::{PROTO_ICMP, PROTO_TCP, PROTO_UDP};
use crate::pipeline::LoopConfig;

#[derive(Parser, Debug)]
#[command(
    name = "bpfsniff",
    version,
    about = "Capture and filter Ethernet/IPv4/TCP/UDP frames on one interface"
)]
pub struct Cli {
    /// Network interface to capture on (e.g. en0, eth0)
    #[arg(short, long)]
    pub interface: String,

    /// IP protocols to match: tcp, udp, icmp or a protocol number
    #[arg(short, long = "protocol", value_delimiter = ',', value_parser = parse_protocol)]
    pub protocols: Vec<u8>,

    /// Source IPv4 addresses to match
    #[arg(long = "src-ip", value_delimiter = ',')]
    pub src_ips: Vec<Ipv4Addr>,

    /// Destination IPv4 addresses to match
    #[arg(long = "dst-ip", value_delimiter = ',')]
    pub dst_ips: Vec<Ipv4Addr>,

    /// Source ports to match (TCP and UDP)
    #[arg(long = "src-port", value_delimiter = ',')]
    pub src_ports: Vec<u16>,

    /// Destination ports to match (TCP and UDP)
    #[arg(long = "dst-port", value_delimiter = ',')]
    pub dst_ports: Vec<u16>,

    /// Capture buffer size in bytes [default: 4096]
    #[arg(long, default_value_t = DEFAULT_BUFFER_SIZE, value_parser = validate_buffer_size)]
    pub buffer_size: u32,

    /// Sleep between polls when no data is available, in milliseconds [default: 10]
    #[arg(long, default_value_t = 10, value_parser = validate_backoff)]
    pub backoff_ms: u64,

    /// Put the interface into promiscuous mode
    #[arg(long)]
    pub promisc: bool,

    /// Also install the filter in the kernel as a classic BPF program
    #[arg(long)]
    pub kernel_filter: bool,

    /// Output format [default: text]
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,

    /// Stop after this many matched frames
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub max_frames: Option<u64>,
}

impl Cli {
    pub fn criteria(&self) -> FilterCriteria {
        FilterCriteria::open()
            .with_protocols(self.protocols.iter().copied())
            .with_src_ips(self.src_ips.iter().copied())
            .with_dst_ips(self.dst_ips.iter().copied())
            .with_src_ports(self.src_ports.iter().copied())
            .with_dst_ports(self.dst_ports.iter().copied())
    }

    /// Device options; the kernel filter program is compiled separately.
    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            buffer_size: self.buffer_size,
            promiscuous: self.promisc,
            kernel_filter: None,
        }
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            backoff: Duration::from_millis(self.backoff_ms),
            max_frames: self.max_frames,
        }
    }
}

fn parse_protocol(s: &str) -> Result<u8, String> {
    match s.to_ascii_lowercase().as_str() {
        "tcp" => Ok(PROTO_TCP),
        "udp" => Ok(PROTO_UDP),
        "icmp" => Ok(PROTO_ICMP),
        other => other
            .parse()
            .map_err(|_| format!("'{s}' is not tcp, udp, icmp or a protocol number 0-255")),
    }
}

fn validate_buffer_size(s: &str) -> Result<u32, String> {
    let val: u32 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val < 4096 {
        Err("buffer-size must be at least 4096 bytes".to_string())
    } else if val > 1_048_576 {
        Err("buffer-size must be at most 1048576 bytes".to_string())
    } else {
        Ok(val)
    }
}

fn validate_backoff(s: &str) -> Result<u64, String> {
    let val: u64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid integer"))?;
    if val > 1000 {
        Err("backoff-ms must be at most 1000".to_string())
    } else {
        Ok(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("bpfsniff").chain(args.iter().copied()))
    }

    #[test]
    fn interface_is_required() {
        assert!(parse(&[]).is_err());
        let cli = parse(&["-i", "en0"]).unwrap();
        assert_eq!(cli.interface, "en0");
    }

    #[test]
    fn defaults() {
        let cli = parse(&["--interface", "eth0"]).unwrap();
        assert_eq!(cli.buffer_size, 4096);
        assert_eq!(cli.backoff_ms, 10);
        assert!(!cli.promisc);
        assert!(!cli.kernel_filter);
        assert_eq!(cli.format, OutputFormat::Text);
        assert_eq!(cli.max_frames, None);
        assert!(cli.criteria().is_open());
        assert_eq!(cli.loop_config().backoff, Duration::from_millis(10));
    }

    #[test]
    fn protocol_names_and_numbers() {
        let cli = parse(&["-i", "en0", "-p", "tcp,UDP", "--protocol", "47"]).unwrap();
        assert_eq!(cli.protocols, vec![6, 17, 47]);
        assert!(parse(&["-i", "en0", "-p", "sctp"]).is_err());
        assert!(parse(&["-i", "en0", "-p", "256"]).is_err());
    }

    #[test]
    fn filter_lists_build_criteria() {
        let cli = parse(&[
            "-i",
            "en0",
            "--src-ip",
            "10.0.0.1,10.0.0.2",
            "--dst-ip",
            "8.8.8.8",
            "--src-port",
            "443",
            "--src-port",
            "8443",
            "--dst-port",
            "53",
        ])
        .unwrap();
        let c = cli.criteria();
        assert_eq!(c.src_ips.len(), 2);
        assert!(c.dst_ips.contains(&Ipv4Addr::new(8, 8, 8, 8)));
        assert!(c.src_ports.contains(&443) && c.src_ports.contains(&8443));
        assert!(c.dst_ports.contains(&53));
        assert!(c.protocols.is_empty());
    }

    #[test]
    fn invalid_addresses_and_ports_rejected() {
        assert!(parse(&["-i", "en0", "--src-ip", "10.0.0.256"]).is_err());
        assert!(parse(&["-i", "en0", "--dst-ip", "::1"]).is_err());
        assert!(parse(&["-i", "en0", "--dst-port", "65536"]).is_err());
    }

    #[test]
    fn buffer_size_bounds() {
        assert!(parse(&["-i", "en0", "--buffer-size", "4095"]).is_err());
        assert!(parse(&["-i", "en0", "--buffer-size", "1048577"]).is_err());
        let cli = parse(&["-i", "en0", "--buffer-size", "65536", "--promisc"]).unwrap();
        let config = cli.capture_config();
        assert_eq!(config.buffer_size, 65536);
        assert!(config.promiscuous);
        assert!(config.kernel_filter.is_none());
    }

    #[test]
    fn backoff_and_limits() {
        assert!(parse(&["-i", "en0", "--backoff-ms", "5000"]).is_err());
        assert!(parse(&["-i", "en0", "--max-frames", "0"]).is_err());
        let cli = parse(&["-i", "en0", "--backoff-ms", "0", "--max-frames", "3"]).unwrap();
        let lc = cli.loop_config();
        assert_eq!(lc.backoff, Duration::ZERO);
        assert_eq!(lc.max_frames, Some(3));
    }

    #[test]
    fn json_format() {
        let cli = parse(&["-i", "en0", "--format", "json", "--kernel-filter"]).unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(cli.kernel_filter);
    }
}
