//! The capture loop: CaptureSource → PacketFilter → HeaderDecoder → Reporter.
//!
//! ```text
//! Starting ──open ok──▶ Running ──cancel / max-frames / fatal──▶ Draining ──▶ Stopped
//!     └──────────────open failed───────────────────────────────────────────────▲
//! ```
//!
//! The loop owns the capture source for its whole life and drops it in
//! Draining, so the kernel handle is released exactly once on every path.

use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::capture::{CaptureSource, CaptureStats, Frame, ReadStatus};
use crate::error::SniffError;
use crate::filter::PacketFilter;
use crate::output::{MatchedFrame, Reporter};
use crate::packet;
use crate::signal::CancelToken;

/// Default sleep after a read that returned no data.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub backoff: Duration,
    /// Stop after this many matched frames.
    pub max_frames: Option<u64>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF,
            max_frames: None,
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureSummary {
    /// Reads that returned data.
    pub reads: u64,
    /// Reads that returned no data; each was followed by exactly one backoff.
    pub idle_polls: u64,
    /// Non-empty frames examined.
    pub frames: u64,
    pub matched: u64,
    pub filtered: u64,
    pub decode_failures: u64,
    /// Kernel counters collected while draining, if the source has them.
    pub kernel: Option<CaptureStats>,
}

/// Why the Running state ended.
enum Exit {
    Cancelled,
    FrameLimit,
    Failed(SniffError),
}

pub struct CaptureLoop<R: Reporter> {
    filter: PacketFilter,
    reporter: R,
    config: LoopConfig,
    cancel: CancelToken,
    state: LoopState,
    summary: CaptureSummary,
}

impl<R: Reporter> CaptureLoop<R> {
    pub fn new(filter: PacketFilter, reporter: R, config: LoopConfig, cancel: CancelToken) -> Self {
        Self {
            filter,
            reporter,
            config,
            cancel,
            state: LoopState::Starting,
            summary: CaptureSummary::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn summary(&self) -> &CaptureSummary {
        &self.summary
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    pub fn into_reporter(self) -> R {
        self.reporter
    }

    /// Open a source with `open` and capture until cancelled, the frame
    /// limit is reached, or a fatal error occurs.
    pub fn run<S, F>(&mut self, open: F) -> Result<CaptureSummary, SniffError>
    where
        S: CaptureSource,
        F: FnOnce() -> Result<S, SniffError>,
    {
        self.state = LoopState::Starting;
        let mut source = match open() {
            Ok(source) => source,
            Err(e) => {
                self.state = LoopState::Stopped;
                return Err(e);
            }
        };

        self.state = LoopState::Running;
        log::info!(
            "Capturing on {} (buffer={}, framing={:?})",
            source.interface(),
            source.buffer_len(),
            source.framing()
        );
        let exit = self.capture(&mut source);

        self.state = LoopState::Draining;
        self.summary.kernel = source.stats();
        let interface = source.interface().to_string();
        drop(source);
        let flushed = self.reporter.flush();
        self.state = LoopState::Stopped;
        self.log_summary(&interface);

        match exit {
            Exit::Failed(e) => Err(e),
            Exit::Cancelled | Exit::FrameLimit => flushed.map(|()| self.summary),
        }
    }

    fn capture<S: CaptureSource>(&mut self, source: &mut S) -> Exit {
        let framing = source.framing();
        let mut buf = vec![0u8; source.buffer_len()];

        loop {
            if self.cancel.is_cancelled() {
                log::info!("Cancellation requested");
                return Exit::Cancelled;
            }

            let n = match source.read_next(&mut buf) {
                Ok(ReadStatus::Data(n)) => n,
                Ok(ReadStatus::NoData) => {
                    self.summary.idle_polls += 1;
                    log::trace!("No data, backing off {:?}", self.config.backoff);
                    thread::sleep(self.config.backoff);
                    continue;
                }
                Err(e) => return Exit::Failed(e),
            };
            self.summary.reads += 1;

            for frame in framing.frames(&buf[..n.min(buf.len())]) {
                if let Err(e) = self.process(frame) {
                    return Exit::Failed(e);
                }
                if self.limit_reached() {
                    log::info!("Reached frame limit");
                    return Exit::FrameLimit;
                }
            }
        }
    }

    fn process(&mut self, frame: Frame<'_>) -> Result<(), SniffError> {
        if frame.data.is_empty() {
            return Ok(());
        }
        self.summary.frames += 1;

        match self.filter.matches(frame.data) {
            Ok(true) => {}
            Ok(false) => {
                self.summary.filtered += 1;
                return Ok(());
            }
            Err(e) => {
                self.summary.decode_failures += 1;
                log::debug!("Discarding {}-byte frame: {e}", frame.data.len());
                return Ok(());
            }
        }

        let headers = match packet::decode_frame(frame.data) {
            Ok(headers) => headers,
            Err(e) => {
                self.summary.decode_failures += 1;
                log::debug!("Discarding matched {}-byte frame: {e}", frame.data.len());
                return Ok(());
            }
        };

        self.summary.matched += 1;
        self.reporter.report(&MatchedFrame {
            seq: self.summary.matched,
            timestamp_us: frame.timestamp_us,
            headers,
            raw: frame.data,
        })
    }

    fn limit_reached(&self) -> bool {
        self.config
            .max_frames
            .is_some_and(|max| self.summary.matched >= max)
    }

    fn log_summary(&self, interface: &str) {
        let s = &self.summary;
        log::info!(
            "Capture on {} stopped: reads={} idle={} frames={} matched={} filtered={} decode_failures={}",
            interface,
            s.reads,
            s.idle_polls,
            s.frames,
            s.matched,
            s.filtered,
            s.decode_failures
        );
        if let Some(k) = s.kernel {
            log::info!("Kernel: received={} dropped={}", k.received, k.dropped);
        }
    }
}
