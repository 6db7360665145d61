// Linux capture implementation using AF_PACKET raw sockets.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};

use crate::bpf::filter::bpf_insn;
use crate::error::{BindStep, SniffError};

use super::{CaptureConfig, CaptureSource, Framing, ReadStatus};

// ---------------------------------------------------------------------------
// AF_PACKET constants
// ---------------------------------------------------------------------------

const ETH_P_ALL: u16 = 0x0003;
// Protocol 0 keeps the socket off every receive path until bind() names one.
const UNBOUND_PROTOCOL: i32 = 0;
const SOL_PACKET: i32 = 263;
const PACKET_ADD_MEMBERSHIP: i32 = 1;
const PACKET_MR_PROMISC: u16 = 1;

#[repr(C)]
#[allow(non_camel_case_types)]
struct sock_fprog {
    len: u16,
    filter: *const bpf_insn,
}

#[repr(C)]
#[allow(non_camel_case_types)]
struct packet_mreq {
    mr_ifindex: i32,
    mr_type: u16,
    mr_alen: u16,
    mr_address: [u8; 8],
}

/// A non-blocking AF_PACKET socket. Each read yields one Ethernet frame.
pub struct PacketSocket {
    fd: OwnedFd,
    interface: String,
    if_index: u32,
    buffer_len: usize,
}

pub type PlatformCapture = PacketSocket;

impl PacketSocket {
    /// Create an unbound, non-blocking raw socket.
    ///
    /// The socket receives nothing until [`bind`](Self::bind) attaches it to
    /// one interface with `ETH_P_ALL`, so no frame from another interface can
    /// be queued in between.
    pub fn acquire() -> Result<Self, SniffError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                UNBOUND_PROTOCOL,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::EPERM) | Some(libc::EACCES) => SniffError::InsufficientPermission(
                    format!("socket(AF_PACKET): {err} (run as root or grant CAP_NET_RAW)"),
                ),
                _ => SniffError::DeviceUnavailable(format!("socket(AF_PACKET): {err}")),
            });
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        log::debug!("Opened AF_PACKET socket (fd={})", fd.as_raw_fd());

        Ok(Self {
            fd,
            interface: String::new(),
            if_index: 0,
            buffer_len: 0,
        })
    }

    /// Bind to `interface` and size the receive buffer.
    ///
    /// Packet sockets deliver frames as soon as they arrive, so there is no
    /// separate immediate-mode step.
    pub fn bind(&mut self, interface: &str, buffer_size: u32) -> Result<(), SniffError> {
        let c_name = CString::new(interface).map_err(|_| {
            SniffError::InvalidArgument(format!("interface name '{interface}' contains NUL"))
        })?;
        let bind_err = |source: io::Error| SniffError::Bind {
            interface: interface.to_string(),
            step: BindStep::Interface,
            source,
        };

        let if_index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if if_index == 0 {
            return Err(bind_err(io::Error::last_os_error()));
        }

        let sll = link_address(if_index);
        let ret = unsafe {
            libc::bind(
                self.fd.as_raw_fd(),
                &sll as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(bind_err(io::Error::last_os_error()));
        }
        log::debug!("{interface}: immediate delivery is implicit for AF_PACKET");

        let buffer_len = buffer_size.max(4096);
        if let Err(e) = setsockopt(&self.fd, libc::SOL_SOCKET, libc::SO_RCVBUF, &(buffer_len as i32)) {
            log::warn!("SO_RCVBUF failed on {interface}: {e}");
        }

        self.interface = interface.to_string();
        self.if_index = if_index;
        self.buffer_len = buffer_len as usize;
        log::info!(
            "AF_PACKET capture on {} (if_index={}, buffer={})",
            interface,
            if_index,
            self.buffer_len
        );
        Ok(())
    }

    pub fn set_promiscuous(&self) -> io::Result<()> {
        let mreq = packet_mreq {
            mr_ifindex: self.if_index as i32,
            mr_type: PACKET_MR_PROMISC,
            mr_alen: 0,
            mr_address: [0u8; 8],
        };
        setsockopt(&self.fd, SOL_PACKET, PACKET_ADD_MEMBERSHIP, &mreq)
    }

    /// Attach a classic BPF program with `SO_ATTACH_FILTER`.
    pub fn set_filter(&self, program: &[bpf_insn]) -> io::Result<()> {
        let prog = sock_fprog {
            len: program.len() as u16,
            filter: program.as_ptr(),
        };
        setsockopt(&self.fd, libc::SOL_SOCKET, libc::SO_ATTACH_FILTER, &prog)
    }
}

impl CaptureSource for PacketSocket {
    fn interface(&self) -> &str {
        &self.interface
    }

    fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    fn framing(&self) -> Framing {
        Framing::Raw
    }

    fn read_next(&mut self, buf: &mut [u8]) -> Result<ReadStatus, SniffError> {
        super::read_fd(self.fd.as_fd(), buf).map_err(|source| SniffError::Read {
            interface: self.interface.clone(),
            source,
        })
    }
}

impl Drop for PacketSocket {
    fn drop(&mut self) {
        log::debug!("Closing AF_PACKET socket on {}", self.interface);
    }
}

/// Open an AF_PACKET socket bound to `interface`.
///
/// Promiscuous mode and the kernel filter are best-effort: failures are
/// logged and capture continues without them.
pub fn open_capture(interface: &str, config: &CaptureConfig) -> Result<PlatformCapture, SniffError> {
    let mut socket = PacketSocket::acquire()?;
    socket.bind(interface, config.buffer_size)?;

    if config.promiscuous {
        if let Err(e) = socket.set_promiscuous() {
            log::warn!(
                "PACKET_MR_PROMISC failed on {interface}: {e} (continuing without promiscuous mode)"
            );
        }
    }

    if let Some(program) = &config.kernel_filter {
        match socket.set_filter(program) {
            Ok(()) => log::debug!("Attached {}-instruction filter on {interface}", program.len()),
            Err(e) => log::warn!(
                "SO_ATTACH_FILTER failed on {interface}: {e} (filtering in userspace only)"
            ),
        }
    }

    Ok(socket)
}

/// Link-layer address selecting every ethertype on interface `if_index`.
fn link_address(if_index: u32) -> libc::sockaddr_ll {
    let mut sll: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as u16;
    sll.sll_protocol = ETH_P_ALL.to_be();
    sll.sll_ifindex = if_index as i32;
    sll
}

fn setsockopt<T>(fd: &OwnedFd, level: i32, name: i32, val: &T) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            level,
            name,
            val as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
