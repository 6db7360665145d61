//! BPF support: kernel filter programs, read-buffer records, and (on macOS)
//! the `/dev/bpfN` capture device.

pub mod filter;
pub mod record;
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
mod setup;

#[cfg(target_os = "macos")]
mod device;
#[cfg(target_os = "macos")]
pub use device::BpfDevice;
