// macOS capture implementation: wraps BpfDevice from src/bpf/

use crate::bpf::BpfDevice;
use crate::error::SniffError;

use super::{CaptureConfig, CaptureSource, CaptureStats, Framing, ReadStatus};

pub type PlatformCapture = BpfDevice;

impl CaptureSource for BpfDevice {
    fn interface(&self) -> &str {
        BpfDevice::interface(self)
    }

    fn buffer_len(&self) -> usize {
        BpfDevice::buffer_len(self)
    }

    fn framing(&self) -> Framing {
        Framing::BpfRecords
    }

    fn read_next(&mut self, buf: &mut [u8]) -> Result<ReadStatus, SniffError> {
        BpfDevice::read_next(self, buf)
    }

    fn stats(&self) -> Option<CaptureStats> {
        match BpfDevice::stats(self) {
            Ok(stats) => Some(stats),
            Err(e) => {
                log::debug!("BIOCGSTATS on {} failed: {e}", self.interface());
                None
            }
        }
    }
}

/// Acquire a free BPF device and bind it to `interface`.
///
/// Promiscuous mode and the kernel filter are best-effort: failures are
/// logged and capture continues without them.
pub fn open_capture(interface: &str, config: &CaptureConfig) -> Result<PlatformCapture, SniffError> {
    let mut device = BpfDevice::acquire()?;
    device.bind(interface, config.buffer_size)?;

    if config.promiscuous {
        if let Err(e) = device.set_promiscuous() {
            log::warn!("BIOCPROMISC failed on {interface}: {e} (continuing without promiscuous mode)");
        }
    }

    if let Some(program) = &config.kernel_filter {
        match device.set_filter(program) {
            Ok(()) => log::debug!("Installed {}-instruction filter on {interface}", program.len()),
            Err(e) => log::warn!("BIOCSETF failed on {interface}: {e} (filtering in userspace only)"),
        }
    }

    Ok(device)
}
