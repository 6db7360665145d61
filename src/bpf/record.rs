// Record layout of buffers returned by /dev/bpfN reads.
//
// A single read returns zero or more records, each a `bpf_hdr` followed by
// the captured frame, padded so the next record starts on a 4-byte boundary.

/// 32-bit timeval as used by the macOS kernel in `struct bpf_hdr`.
///
/// XNU stores `struct timeval32` (`{int32_t, int32_t}` = 8 bytes) here, not
/// the 16-byte 64-bit `struct timeval`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Timeval32 {
    tv_sec: i32,
    tv_usec: i32,
}

/// BPF packet header as defined in `<net/bpf.h>`.
///
/// `timeval32`(8) + `caplen`(4) + `datalen`(4) + `hdrlen`(2) = 18 bytes,
/// padded to 20.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BpfHdr {
    bh_tstamp: Timeval32,
    pub bh_caplen: u32,
    pub bh_datalen: u32,
    pub bh_hdrlen: u16,
}

const _: () = assert!(std::mem::size_of::<BpfHdr>() == 20);

/// Rounds `x` up to the next 4-byte boundary (kernel `BPF_WORDALIGN`).
#[inline]
pub const fn bpf_wordalign(x: usize) -> usize {
    (x + 3) & !3
}

/// One captured frame inside a BPF read buffer.
#[derive(Debug, Clone, Copy)]
pub struct BpfRecord<'a> {
    /// Capture time in microseconds since the epoch.
    pub timestamp_us: u64,
    /// Length of the frame on the wire; may exceed `data.len()`.
    pub wire_len: u32,
    pub data: &'a [u8],
}

/// Iterator over the records of one BPF read.
///
/// Stops at the first record whose header or captured bytes would run past the
/// end of the buffer.
pub struct BpfRecords<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BpfRecords<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for BpfRecords<'a> {
    type Item = BpfRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let hdr_size = std::mem::size_of::<BpfHdr>();
        if self.pos + hdr_size > self.buf.len() {
            return None;
        }

        let hdr_ptr = self.buf[self.pos..].as_ptr() as *const BpfHdr;
        // SAFETY: `hdr_size` bytes starting at `pos` are in bounds (checked above);
        // the read is unaligned-tolerant.
        let hdr = unsafe { std::ptr::read_unaligned(hdr_ptr) };
        let hdr_len = hdr.bh_hdrlen as usize;
        let cap_len = hdr.bh_caplen as usize;

        let start = self.pos + hdr_len;
        let end = start + cap_len;
        if hdr_len < hdr_size || end > self.buf.len() {
            self.pos = self.buf.len();
            return None;
        }

        self.pos += bpf_wordalign(hdr_len + cap_len);
        let timestamp_us = (hdr.bh_tstamp.tv_sec as i64 as u64)
            .saturating_mul(1_000_000)
            .saturating_add(hdr.bh_tstamp.tv_usec as i64 as u64);
        Some(BpfRecord {
            timestamp_us,
            wire_len: hdr.bh_datalen,
            data: &self.buf[start..end],
        })
    }
}
