// BPF device selection and bind sequencing, independent of the ioctl layer.

use std::io;
use std::ops::Range;

use crate::error::{BindStep, SniffError};

const IFNAMSIZ: usize = 16;

/// Smallest kernel buffer requested from a BPF device.
const MIN_BUFFER_LEN: u32 = 4096;

/// Open the first free `/dev/bpfN` for `N` in `range`.
///
/// `EBUSY` devices are skipped and counted, `EACCES`/`EPERM` aborts the scan,
/// and any other error (typically `ENOENT` past the last node) moves on to the
/// next number.
pub(crate) fn scan_devices<T>(
    range: Range<u32>,
    mut open: impl FnMut(&str) -> io::Result<T>,
) -> Result<(String, T), SniffError> {
    let mut busy = 0u32;
    for i in range.clone() {
        let path = format!("/dev/bpf{i}");
        let err = match open(&path) {
            Ok(handle) => {
                log::info!("Acquired {} ({} busy device(s) skipped)", path, busy);
                return Ok((path, handle));
            }
            Err(err) => err,
        };
        match err.raw_os_error() {
            Some(libc::EBUSY) => {
                busy += 1;
                log::debug!("{path} busy, trying next");
            }
            Some(libc::EACCES) | Some(libc::EPERM) => {
                return Err(SniffError::InsufficientPermission(format!(
                    "cannot open {path}: {err} (run as root or grant access to /dev/bpf*)"
                )));
            }
            _ => log::debug!("{path}: {err}"),
        }
    }

    Err(SniffError::DeviceUnavailable(format!(
        "/dev/bpf{}..{} exhausted ({} busy)",
        range.start,
        range.end.saturating_sub(1),
        busy
    )))
}

/// The control requests issued while binding a BPF device.
pub(crate) trait BindControl {
    fn set_buffer_len(&mut self, len: u32) -> io::Result<()>;
    fn set_interface(&mut self, name: &str) -> io::Result<()>;
    fn set_immediate(&mut self) -> io::Result<()>;
    fn buffer_len(&mut self) -> io::Result<u32>;
}

/// Run the bind sequence and return the buffer length the kernel granted.
///
/// The buffer length must be set before the interface is attached. A failing
/// request is reported as [`SniffError::Bind`] tagged with its [`BindStep`].
pub(crate) fn bind_device<C: BindControl + ?Sized>(
    ctl: &mut C,
    interface: &str,
    buffer_size: u32,
) -> Result<u32, SniffError> {
    if interface.is_empty() || interface.len() >= IFNAMSIZ {
        return Err(SniffError::InvalidArgument(format!(
            "interface name '{interface}' must be 1..{IFNAMSIZ} bytes"
        )));
    }
    let bind_err = |step: BindStep| {
        move |source: io::Error| SniffError::Bind {
            interface: interface.to_string(),
            step,
            source,
        }
    };

    ctl.set_buffer_len(buffer_size.max(MIN_BUFFER_LEN))
        .map_err(bind_err(BindStep::BufferLength))?;
    ctl.set_interface(interface)
        .map_err(bind_err(BindStep::Interface))?;
    ctl.set_immediate().map_err(bind_err(BindStep::Immediate))?;
    ctl.buffer_len().map_err(bind_err(BindStep::BufferLength))
}
