/// Fatal errors that end a capture run.
///
/// Decode failures are not represented here: they are local to a single frame
/// and live in [`crate::packet::DecodeError`].
#[derive(Debug, thiserror::Error)]
pub enum SniffError {
    #[error("{0}")]
    InsufficientPermission(String),
    #[error("no capture device available: {0}")]
    DeviceUnavailable(String),
    #[error("binding to {interface} failed at {step}: {source}")]
    Bind {
        interface: String,
        step: BindStep,
        #[source]
        source: std::io::Error,
    },
    #[error("read on {interface} failed: {source}")]
    Read {
        interface: String,
        #[source]
        source: std::io::Error,
    },
    #[error("capture device error: {0}")]
    CaptureDevice(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("output error: {0}")]
    Output(#[source] std::io::Error),
    #[error("fatal: {0}")]
    Fatal(String),
}

/// The control operation that failed while binding a capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStep {
    /// Associating the handle with the interface (BIOCSETIF / bind(2)).
    Interface,
    /// Enabling immediate frame delivery (BIOCIMMEDIATE).
    Immediate,
    /// Setting the kernel buffer length before binding.
    BufferLength,
}

impl std::fmt::Display for BindStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BindStep::Interface => "interface binding",
            BindStep::Immediate => "immediate mode",
            BindStep::BufferLength => "buffer length",
        };
        f.write_str(name)
    }
}
