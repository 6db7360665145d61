// Platform-abstracted frame capture.
//
// On macOS: /dev/bpfN devices (src/bpf/).
// On Linux: AF_PACKET raw sockets.
//
// Both platforms export:
//   - PlatformCapture type implementing CaptureSource
//   - open_capture(interface, &CaptureConfig) -> Result<PlatformCapture, SniffError>

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

use crate::bpf::filter::bpf_insn;
use crate::bpf::record::BpfRecords;
use crate::error::SniffError;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::*;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::*;

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
compile_error!("bpfsniff captures through /dev/bpf (macOS) or AF_PACKET (Linux) only");

/// Default capture buffer capacity in bytes.
pub const DEFAULT_BUFFER_SIZE: u32 = 4096;

/// Outcome of a single successful read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// `n` valid bytes were written to the start of the buffer.
    Data(usize),
    /// Nothing to read yet.
    NoData,
}

/// Classification of a failed read, decided once at the OS-call boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadErrorClass {
    /// Interrupted by a signal before any data was transferred; retry.
    Interrupted,
    /// Non-blocking descriptor has nothing queued.
    WouldBlock,
    /// Anything else. Ends the run.
    Fatal,
}

impl ReadErrorClass {
    pub fn of(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::Interrupted => ReadErrorClass::Interrupted,
            io::ErrorKind::WouldBlock => ReadErrorClass::WouldBlock,
            _ => ReadErrorClass::Fatal,
        }
    }
}

/// Read once from a non-blocking descriptor.
///
/// `EINTR` is retried here and never reaches the caller. `EAGAIN` and a
/// zero-length read both map to [`ReadStatus::NoData`].
pub fn read_fd(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<ReadStatus> {
    loop {
        let n = unsafe {
            libc::read(
                fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n > 0 {
            return Ok(ReadStatus::Data(n as usize));
        }
        if n == 0 {
            return Ok(ReadStatus::NoData);
        }

        let err = io::Error::last_os_error();
        match ReadErrorClass::of(&err) {
            ReadErrorClass::Interrupted => continue,
            ReadErrorClass::WouldBlock => return Ok(ReadStatus::NoData),
            ReadErrorClass::Fatal => return Err(err),
        }
    }
}

/// How the bytes of one read are split into link-layer frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Each read returns exactly one frame (AF_PACKET sockets).
    Raw,
    /// Each read returns a sequence of `bpf_hdr` records (BPF devices).
    BpfRecords,
}

/// One frame cut out of a read buffer.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub data: &'a [u8],
    /// Kernel capture timestamp (microseconds since epoch), when the source provides one.
    pub timestamp_us: Option<u64>,
}

impl Framing {
    pub fn frames(self, data: &[u8]) -> Frames<'_> {
        match self {
            Framing::Raw => Frames::Raw(Some(data).filter(|d| !d.is_empty())),
            Framing::BpfRecords => Frames::Bpf(BpfRecords::new(data)),
        }
    }
}

pub enum Frames<'a> {
    Raw(Option<&'a [u8]>),
    Bpf(BpfRecords<'a>),
}

impl<'a> Iterator for Frames<'a> {
    type Item = Frame<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Frames::Raw(slot) => slot.take().map(|data| Frame {
                data,
                timestamp_us: None,
            }),
            Frames::Bpf(records) => records.next().map(|r| Frame {
                data: r.data,
                timestamp_us: Some(r.timestamp_us),
            }),
        }
    }
}

/// Kernel-level counters, where the platform provides them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CaptureStats {
    pub received: u32,
    pub dropped: u32,
}

/// Device options applied while opening a capture source.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Requested capture buffer size; the platform may round it.
    pub buffer_size: u32,
    pub promiscuous: bool,
    /// Compiled kernel filter program, if kernel-side filtering is enabled.
    pub kernel_filter: Option<Vec<bpf_insn>>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            promiscuous: false,
            kernel_filter: None,
        }
    }
}

/// A source of raw link-layer frames.
///
/// Implementations own their OS handle and release it on drop.
pub trait CaptureSource {
    /// Interface the source is bound to.
    fn interface(&self) -> &str;

    /// Size of the buffer `read_next` expects.
    fn buffer_len(&self) -> usize;

    fn framing(&self) -> Framing;

    /// One non-blocking read attempt. Errors are fatal to the run.
    fn read_next(&mut self, buf: &mut [u8]) -> Result<ReadStatus, SniffError>;

    fn stats(&self) -> Option<CaptureStats> {
        None
    }
}

impl<S: CaptureSource + ?Sized> CaptureSource for Box<S> {
    fn interface(&self) -> &str {
        (**self).interface()
    }

    fn buffer_len(&self) -> usize {
        (**self).buffer_len()
    }

    fn framing(&self) -> Framing {
        (**self).framing()
    }

    fn read_next(&mut self, buf: &mut [u8]) -> Result<ReadStatus, SniffError> {
        (**self).read_next(buf)
    }

    fn stats(&self) -> Option<CaptureStats> {
        (**self).stats()
    }
}
