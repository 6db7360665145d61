// Integration tests: drive CaptureLoop end to end with scripted capture sources.

use std::collections::VecDeque;
use std::io;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use bpfsniff::capture::{CaptureSource, CaptureStats, Framing, ReadStatus};
use bpfsniff::error::SniffError;
use bpfsniff::filter::{FilterCriteria, PacketFilter};
use bpfsniff::output::{JsonReporter, MatchedFrame, Reporter, TextReporter};
use bpfsniff::packet::{PROTO_ICMP, PROTO_TCP, PROTO_UDP, TransportHeader};
use bpfsniff::pipeline::{CaptureLoop, LoopConfig, LoopState};
use bpfsniff::signal::CancelToken;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Ethernet + 20-byte IPv4 + minimal L4 header.
fn frame(proto: u8, src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16) -> Vec<u8> {
    let mut pkt = vec![
        0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, // dst mac
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, // src mac
        0x08, 0x00,
    ];
    let l4_len: u16 = if proto == PROTO_TCP { 20 } else { 8 };
    pkt.extend_from_slice(&[0x45, 0x00]);
    pkt.extend_from_slice(&(20 + l4_len).to_be_bytes());
    pkt.extend_from_slice(&[0x00, 0x01, 0x40, 0x00, 64, proto, 0x00, 0x00]);
    pkt.extend_from_slice(&src.octets());
    pkt.extend_from_slice(&dst.octets());
    pkt.extend_from_slice(&src_port.to_be_bytes());
    pkt.extend_from_slice(&dst_port.to_be_bytes());
    if proto == PROTO_TCP {
        pkt.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 0, 0x50, 0x02, 0xff, 0xff, 0, 0, 0, 0]);
    } else {
        pkt.extend_from_slice(&[0x00, 0x08, 0x00, 0x00]);
    }
    pkt
}

fn tcp(src_port: u16, dst_port: u16) -> Vec<u8> {
    frame(
        PROTO_TCP,
        Ipv4Addr::new(192, 168, 0, 10),
        Ipv4Addr::new(192, 168, 0, 20),
        src_port,
        dst_port,
    )
}

fn udp(src_port: u16, dst_port: u16) -> Vec<u8> {
    frame(
        PROTO_UDP,
        Ipv4Addr::new(192, 168, 0, 10),
        Ipv4Addr::new(192, 168, 0, 20),
        src_port,
        dst_port,
    )
}

/// Wrap frames in kernel BPF records (20-byte header, 4-byte alignment).
fn bpf_records(frames: &[Vec<u8>], tv_sec: i32) -> Vec<u8> {
    let mut buf = Vec::new();
    for (i, f) in frames.iter().enumerate() {
        let start = buf.len();
        buf.extend_from_slice(&tv_sec.to_ne_bytes());
        buf.extend_from_slice(&(i as i32).to_ne_bytes());
        buf.extend_from_slice(&(f.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&(f.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&20u16.to_ne_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(f);
        buf.resize(start + ((20 + f.len() + 3) & !3), 0);
    }
    buf
}

enum Step {
    Data(Vec<u8>),
    NoData,
    Fail,
}

/// Replays a fixed script of reads, then cancels the run.
struct ScriptedSource {
    steps: VecDeque<Step>,
    framing: Framing,
    cancel: CancelToken,
    stats: Option<CaptureStats>,
    reads: usize,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>, cancel: &CancelToken) -> Self {
        Self {
            steps: steps.into(),
            framing: Framing::Raw,
            cancel: cancel.clone(),
            stats: None,
            reads: 0,
        }
    }
}

impl CaptureSource for ScriptedSource {
    fn interface(&self) -> &str {
        "scripted0"
    }

    fn buffer_len(&self) -> usize {
        4096
    }

    fn framing(&self) -> Framing {
        self.framing
    }

    fn read_next(&mut self, buf: &mut [u8]) -> Result<ReadStatus, SniffError> {
        self.reads += 1;
        match self.steps.pop_front() {
            Some(Step::Data(bytes)) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(ReadStatus::Data(bytes.len()))
            }
            Some(Step::NoData) => Ok(ReadStatus::NoData),
            Some(Step::Fail) => Err(SniffError::Read {
                interface: "scripted0".to_string(),
                source: io::Error::from_raw_os_error(libc::ENETDOWN),
            }),
            None => {
                self.cancel.cancel();
                Ok(ReadStatus::NoData)
            }
        }
    }

    fn stats(&self) -> Option<CaptureStats> {
        self.stats
    }
}

#[derive(Default)]
struct Recorded {
    frames: Vec<(u64, Option<u64>, Vec<u8>, Option<TransportHeader>)>,
}

impl Reporter for Recorded {
    fn report(&mut self, frame: &MatchedFrame<'_>) -> Result<(), SniffError> {
        self.frames.push((
            frame.seq,
            frame.timestamp_us,
            frame.raw.to_vec(),
            frame.headers.transport,
        ));
        Ok(())
    }
}

fn new_loop(criteria: FilterCriteria, cancel: &CancelToken) -> CaptureLoop<Recorded> {
    CaptureLoop::new(
        PacketFilter::new(criteria),
        Recorded::default(),
        LoopConfig {
            backoff: Duration::ZERO,
            max_frames: None,
        },
        cancel.clone(),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn tcp_source_port_443_reported_exactly_once() {
    let cancel = CancelToken::new();
    let mut lp = new_loop(FilterCriteria::open().with_src_ports([443]), &cancel);
    let source = ScriptedSource::new(vec![Step::Data(tcp(443, 51000))], &cancel);

    let summary = lp.run(|| Ok(source)).unwrap();

    assert_eq!(lp.state(), LoopState::Stopped);
    assert_eq!(summary.matched, 1);
    let frames = &lp.reporter().frames;
    assert_eq!(frames.len(), 1);
    let (seq, ts, raw, transport) = &frames[0];
    assert_eq!(*seq, 1);
    assert_eq!(*ts, None);
    assert_eq!(raw.len(), 54);
    match transport {
        Some(TransportHeader::Tcp(h)) => {
            assert_eq!(h.src_port, 443);
            assert_eq!(h.dst_port, 51000);
        }
        other => panic!("expected TCP header, got {other:?}"),
    }
}

#[test]
fn tcp_protocol_filter_without_ports_reports_443_frame_once() {
    let cancel = CancelToken::new();
    let mut lp = new_loop(FilterCriteria::open().with_protocols([PROTO_TCP]), &cancel);
    let source = ScriptedSource::new(vec![Step::Data(tcp(443, 51000))], &cancel);

    let summary = lp.run(|| Ok(source)).unwrap();

    assert_eq!(summary.frames, 1);
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.filtered, 0);
    let frames = &lp.reporter().frames;
    assert_eq!(frames.len(), 1);
    let (seq, _, raw, transport) = &frames[0];
    assert_eq!(*seq, 1);
    assert_eq!(raw.len(), 54);
    assert!(matches!(
        transport,
        Some(TransportHeader::Tcp(h)) if h.src_port == 443 && h.dst_port == 51000
    ));
}

#[test]
fn bad_ihl_on_non_port_protocol_is_a_decode_failure() {
    let cancel = CancelToken::new();
    let mut lp = new_loop(FilterCriteria::open(), &cancel);
    let mut icmp = frame(
        PROTO_ICMP,
        Ipv4Addr::new(192, 168, 0, 10),
        Ipv4Addr::new(192, 168, 0, 20),
        0x0800,
        0,
    );
    icmp[14] = 0x43;
    let source = ScriptedSource::new(vec![Step::Data(icmp), Step::Data(udp(53, 5353))], &cancel);

    let summary = lp.run(|| Ok(source)).unwrap();

    assert_eq!(summary.frames, 2);
    assert_eq!(summary.decode_failures, 1);
    assert_eq!(summary.matched, 1);
    let frames = &lp.reporter().frames;
    assert_eq!(frames.len(), 1);
    assert!(matches!(frames[0].3, Some(TransportHeader::Udp(_))));
}

#[test]
fn each_no_data_read_is_followed_by_exactly_one_backoff() {
    let cancel = CancelToken::new();
    let backoff = Duration::from_millis(5);
    let mut lp = CaptureLoop::new(
        PacketFilter::default(),
        Recorded::default(),
        LoopConfig {
            backoff,
            max_frames: None,
        },
        cancel.clone(),
    );
    let source = ScriptedSource::new(
        vec![
            Step::NoData,
            Step::NoData,
            Step::Data(tcp(1, 2)),
            Step::NoData,
        ],
        &cancel,
    );

    let started = Instant::now();
    let summary = lp.run(|| Ok(source)).unwrap();
    let elapsed = started.elapsed();

    // Three scripted NoData reads plus the final one that cancels.
    assert_eq!(summary.idle_polls, 4);
    assert_eq!(summary.reads, 1);
    assert_eq!(summary.matched, 1);
    assert!(elapsed >= backoff * 4, "elapsed {elapsed:?}");
}

#[test]
fn cancellation_is_observed_before_the_next_read() {
    let cancel = CancelToken::new();
    cancel.cancel();
    let mut lp = new_loop(FilterCriteria::open(), &cancel);
    let source = ScriptedSource::new(vec![Step::Data(tcp(1, 2))], &cancel);

    let summary = lp.run(|| Ok(source)).unwrap();

    assert_eq!(summary.reads, 0);
    assert_eq!(summary.idle_polls, 0);
    assert!(lp.reporter().frames.is_empty());
    assert_eq!(lp.state(), LoopState::Stopped);
}

#[test]
fn fatal_read_error_ends_the_run() {
    let cancel = CancelToken::new();
    let mut lp = new_loop(FilterCriteria::open(), &cancel);
    let source = ScriptedSource::new(
        vec![Step::Data(tcp(1, 2)), Step::Fail, Step::Data(tcp(3, 4))],
        &cancel,
    );

    let err = lp.run(|| Ok(source)).unwrap_err();

    match err {
        SniffError::Read { interface, source } => {
            assert_eq!(interface, "scripted0");
            assert_eq!(source.raw_os_error(), Some(libc::ENETDOWN));
        }
        other => panic!("expected read error, got {other}"),
    }
    assert_eq!(lp.state(), LoopState::Stopped);
    assert_eq!(lp.reporter().frames.len(), 1);
    assert!(!cancel.is_cancelled());
}

#[test]
fn open_failure_never_reads() {
    let cancel = CancelToken::new();
    let mut lp = new_loop(FilterCriteria::open(), &cancel);

    let result = lp.run(|| -> Result<ScriptedSource, SniffError> {
        Err(SniffError::Bind {
            interface: "nope0".to_string(),
            step: bpfsniff::error::BindStep::Interface,
            source: io::Error::from_raw_os_error(libc::ENXIO),
        })
    });

    assert!(matches!(result, Err(SniffError::Bind { .. })));
    assert_eq!(lp.state(), LoopState::Stopped);
    assert_eq!(lp.summary().reads, 0);
}

#[test]
fn filtered_and_undecodable_frames_are_counted_not_reported() {
    let cancel = CancelToken::new();
    let mut lp = new_loop(FilterCriteria::open().with_protocols([PROTO_UDP]), &cancel);
    let source = ScriptedSource::new(
        vec![
            Step::Data(tcp(443, 1)),
            Step::Data(udp(53, 5353)),
            Step::Data(vec![0xff; 12]),
            Step::Data(udp(5353, 53)[..30].to_vec()),
        ],
        &cancel,
    );

    let summary = lp.run(|| Ok(source)).unwrap();

    assert_eq!(summary.frames, 4);
    assert_eq!(summary.matched, 1);
    assert_eq!(summary.filtered, 1);
    assert_eq!(summary.decode_failures, 2);
    assert_eq!(lp.reporter().frames.len(), 1);
}

#[test]
fn bpf_records_are_split_and_timestamped() {
    let cancel = CancelToken::new();
    let mut lp = new_loop(FilterCriteria::open().with_dst_ports([53]), &cancel);
    let mut source = ScriptedSource::new(
        vec![Step::Data(bpf_records(
            &[udp(40000, 53), tcp(40001, 80), udp(40002, 53)],
            1_700_000_000,
        ))],
        &cancel,
    );
    source.framing = Framing::BpfRecords;
    source.stats = Some(CaptureStats {
        received: 3,
        dropped: 0,
    });

    let summary = lp.run(|| Ok(source)).unwrap();

    assert_eq!(summary.reads, 1);
    assert_eq!(summary.frames, 3);
    assert_eq!(summary.matched, 2);
    assert_eq!(
        summary.kernel,
        Some(CaptureStats {
            received: 3,
            dropped: 0
        })
    );
    let frames = &lp.reporter().frames;
    assert_eq!(frames[0].0, 1);
    assert_eq!(frames[0].1, Some(1_700_000_000_000_000));
    assert_eq!(frames[1].0, 2);
    assert_eq!(frames[1].1, Some(1_700_000_000_000_002));
}

#[test]
fn max_frames_stops_without_cancellation() {
    let cancel = CancelToken::new();
    let mut lp = CaptureLoop::new(
        PacketFilter::default(),
        Recorded::default(),
        LoopConfig {
            backoff: Duration::ZERO,
            max_frames: Some(2),
        },
        cancel.clone(),
    );
    let source = ScriptedSource::new(
        vec![
            Step::Data(tcp(1, 1)),
            Step::Data(tcp(2, 2)),
            Step::Data(tcp(3, 3)),
        ],
        &cancel,
    );

    let summary = lp.run(|| Ok(source)).unwrap();

    assert_eq!(summary.matched, 2);
    assert_eq!(summary.reads, 2);
    assert!(!cancel.is_cancelled());
}

#[test]
fn text_and_json_reporters_plug_into_the_loop() {
    let cancel = CancelToken::new();
    let mut text = CaptureLoop::new(
        PacketFilter::default(),
        TextReporter::new(Vec::new()),
        LoopConfig {
            backoff: Duration::ZERO,
            max_frames: None,
        },
        cancel.clone(),
    );
    text.run(|| Ok(ScriptedSource::new(vec![Step::Data(tcp(443, 51000))], &cancel)))
        .unwrap();
    let out = String::from_utf8(text.into_reporter().into_inner()).unwrap();
    assert_eq!(
        out,
        "#1 192.168.0.10:443 -> 192.168.0.20:51000 TCP [SYN] len=54\n"
    );

    let cancel = CancelToken::new();
    let mut json = CaptureLoop::new(
        PacketFilter::default(),
        JsonReporter::new(Vec::new()),
        LoopConfig {
            backoff: Duration::ZERO,
            max_frames: None,
        },
        cancel.clone(),
    );
    json.run(|| Ok(ScriptedSource::new(vec![Step::Data(udp(53, 5353))], &cancel)))
        .unwrap();
    let out = json.into_reporter().into_inner();
    let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(v["seq"], 1);
    assert_eq!(v["transport"]["protocol"], "udp");
    assert_eq!(v["ipv4"]["dst"], "192.168.0.20");
}
