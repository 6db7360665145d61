// /dev/bpfN capture device (macOS).

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

use crate::capture::{self, CaptureStats, ReadStatus};
use crate::error::SniffError;

use super::filter::bpf_insn;
use super::setup::{BindControl, bind_device, scan_devices};

// ---------------------------------------------------------------------------
// BPF ioctl constants (macOS-specific)
// ---------------------------------------------------------------------------

// macOS _IOC encoding: direction bits [31:29] | size [28:16] | group [15:8] | number [7:0]
const fn ioc(dir: u32, group: u8, num: u8, size: u32) -> libc::c_ulong {
    (dir | ((size & 0x1FFF) << 16) | ((group as u32) << 8) | num as u32) as libc::c_ulong
}

const IOC_VOID: u32 = 0x20000000;
const IOC_OUT: u32 = 0x40000000;
const IOC_IN: u32 = 0x80000000;
const IOC_INOUT: u32 = IOC_IN | IOC_OUT;

const BIOCSBLEN: libc::c_ulong = ioc(IOC_INOUT, b'B', 102, 4); // _IOWR('B', 102, u_int)
const BIOCGBLEN: libc::c_ulong = ioc(IOC_OUT, b'B', 102, 4); // _IOR('B', 102, u_int)
const BIOCSETF: libc::c_ulong = ioc(IOC_IN, b'B', 103, 16); // _IOW('B', 103, bpf_program)
const BIOCPROMISC: libc::c_ulong = ioc(IOC_VOID, b'B', 105, 0); // _IO('B', 105)
const BIOCSETIF: libc::c_ulong = ioc(IOC_IN, b'B', 108, 32); // _IOW('B', 108, ifreq)
const BIOCGSTATS: libc::c_ulong = ioc(IOC_OUT, b'B', 111, 8); // _IOR('B', 111, bpf_stat)
const BIOCIMMEDIATE: libc::c_ulong = ioc(IOC_IN, b'B', 112, 4); // _IOW('B', 112, u_int)

const _: () = assert!(BIOCSBLEN == 0xC004_4266);
const _: () = assert!(BIOCGBLEN == 0x4004_4266);
const _: () = assert!(BIOCSETF == 0x8010_4267);
const _: () = assert!(BIOCPROMISC == 0x2000_4269);
const _: () = assert!(BIOCSETIF == 0x8020_426C);
const _: () = assert!(BIOCGSTATS == 0x4008_426F);
const _: () = assert!(BIOCIMMEDIATE == 0x8004_4270);

/// Candidate device numbers scanned by [`BpfDevice::acquire`].
const DEVICE_RANGE: std::ops::Range<u32> = 0..256;

#[repr(C)]
struct bpf_program {
    bf_len: u32,
    _pad: u32,
    bf_insns: *mut bpf_insn,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct bpf_stat {
    bs_recv: u32,
    bs_drop: u32,
}

const _: () = assert!(std::mem::size_of::<bpf_stat>() == 8);

/// An open, non-blocking `/dev/bpfN` handle.
///
/// The descriptor is closed exactly once, when the device is dropped.
pub struct BpfDevice {
    fd: OwnedFd,
    path: String,
    interface: String,
    buffer_len: usize,
}

impl BpfDevice {
    /// Open the first free BPF device and switch it to non-blocking mode.
    ///
    /// Devices held by another process (`EBUSY`) are skipped.
    pub fn acquire() -> Result<Self, SniffError> {
        let (path, fd) = scan_devices(DEVICE_RANGE, open_device)?;
        set_nonblocking(&fd)
            .map_err(|e| SniffError::CaptureDevice(format!("O_NONBLOCK on {path}: {e}")))?;
        Ok(Self {
            fd,
            path,
            interface: String::new(),
            buffer_len: 0,
        })
    }

    /// Bind to `interface` and enable immediate delivery.
    ///
    /// The length actually granted is read back and becomes
    /// [`BpfDevice::buffer_len`]; reads must use exactly that size.
    pub fn bind(&mut self, interface: &str, buffer_size: u32) -> Result<(), SniffError> {
        let granted = bind_device(&mut Ioctls(&self.fd), interface, buffer_size)?;
        self.interface = interface.to_string();
        self.buffer_len = granted as usize;
        log::info!(
            "{} bound to {} (buffer={}, immediate)",
            self.path,
            interface,
            self.buffer_len
        );
        Ok(())
    }

    /// Enable promiscuous mode. Not all interfaces support it.
    pub fn set_promiscuous(&self) -> io::Result<()> {
        if unsafe { libc::ioctl(self.fd.as_raw_fd(), BIOCPROMISC) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Install a kernel filter program.
    pub fn set_filter(&self, program: &[bpf_insn]) -> io::Result<()> {
        let mut insns = program.to_vec();
        let prog = bpf_program {
            bf_len: insns.len() as u32,
            _pad: 0,
            bf_insns: insns.as_mut_ptr(),
        };
        if unsafe { libc::ioctl(self.fd.as_raw_fd(), BIOCSETF, &prog as *const bpf_program) } != 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Single non-blocking read into `buf`, which must be `buffer_len()` bytes.
    pub fn read_next(&mut self, buf: &mut [u8]) -> Result<ReadStatus, SniffError> {
        capture::read_fd(self.fd.as_fd(), buf).map_err(|source| SniffError::Read {
            interface: self.interface.clone(),
            source,
        })
    }

    /// Kernel receive/drop counters.
    pub fn stats(&self) -> io::Result<CaptureStats> {
        let mut stats = bpf_stat::default();
        ioctl_get(&self.fd, BIOCGSTATS, &mut stats)?;
        Ok(CaptureStats {
            received: stats.bs_recv,
            dropped: stats.bs_drop,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }
}

impl Drop for BpfDevice {
    fn drop(&mut self) {
        log::debug!("Releasing {}", self.path);
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn open_device(path: &str) -> io::Result<OwnedFd> {
    let c_path = CString::new(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDWR | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind-time requests issued as ioctls on an open device.
struct Ioctls<'a>(&'a OwnedFd);

impl BindControl for Ioctls<'_> {
    fn set_buffer_len(&mut self, len: u32) -> io::Result<()> {
        ioctl_set(self.0, BIOCSBLEN, &len)
    }

    fn set_interface(&mut self, name: &str) -> io::Result<()> {
        set_interface(self.0, name)
    }

    fn set_immediate(&mut self) -> io::Result<()> {
        ioctl_set(self.0, BIOCIMMEDIATE, &1u32)
    }

    fn buffer_len(&mut self) -> io::Result<u32> {
        let mut actual: u32 = 0;
        ioctl_get(self.0, BIOCGBLEN, &mut actual)?;
        Ok(actual)
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd.as_raw_fd(), libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_interface(fd: &OwnedFd, name: &str) -> io::Result<()> {
    // ifreq is 32 bytes with the NUL-terminated name in the first IFNAMSIZ;
    // callers guarantee name.len() < IFNAMSIZ
    let mut ifreq = [0u8; 32];
    let name_bytes = name.as_bytes();
    ifreq[..name_bytes.len()].copy_from_slice(name_bytes);

    if unsafe { libc::ioctl(fd.as_raw_fd(), BIOCSETIF, ifreq.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn ioctl_set<T>(fd: &OwnedFd, request: libc::c_ulong, val: &T) -> io::Result<()> {
    if unsafe { libc::ioctl(fd.as_raw_fd(), request, val as *const T) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn ioctl_get<T>(fd: &OwnedFd, request: libc::c_ulong, val: &mut T) -> io::Result<()> {
    if unsafe { libc::ioctl(fd.as_raw_fd(), request, val as *mut T) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
