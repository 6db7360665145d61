use std::io;

use clap::Parser;

use bpfsniff::bpf::filter;
use bpfsniff::capture;
use bpfsniff::cli::Cli;
use bpfsniff::error::SniffError;
use bpfsniff::filter::{FilterCriteria, PacketFilter};
use bpfsniff::output;
use bpfsniff::pipeline::CaptureLoop;
use bpfsniff::signal::{self, CancelToken};

fn exit_code(err: &SniffError) -> i32 {
    match err {
        SniffError::InvalidArgument(_) | SniffError::InsufficientPermission(_) => 1,
        SniffError::DeviceUnavailable(_)
        | SniffError::Bind { .. }
        | SniffError::CaptureDevice(_) => 2,
        SniffError::Read { .. } => 3,
        SniffError::Output(_) | SniffError::Fatal(_) => 4,
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| run(cli)));

    match result {
        Ok(Ok(())) => std::process::exit(0),
        Ok(Err(e)) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
        Err(_) => {
            eprintln!("error: fatal: unexpected panic");
            std::process::exit(4);
        }
    }
}

fn run(cli: Cli) -> Result<(), SniffError> {
    // Block SIGINT/SIGTERM before anything else spawns a thread.
    let cancel = CancelToken::new();
    signal::spawn_signal_watcher(cancel.clone())?;

    let criteria = cli.criteria();
    log::info!("Filter: {}", describe(&criteria));

    let mut config = cli.capture_config();
    if cli.kernel_filter {
        config.kernel_filter = kernel_program(&criteria);
    }

    let reporter = output::reporter(cli.format, io::stdout());
    let mut capture_loop = CaptureLoop::new(
        PacketFilter::new(criteria),
        reporter,
        cli.loop_config(),
        cancel,
    );

    let interface = cli.interface.clone();
    let summary = capture_loop.run(|| capture::open_capture(&interface, &config))?;
    log::debug!("Summary: {}", serde_json::to_string(&summary).unwrap_or_default());
    Ok(())
}

/// Compile the criteria to a kernel program, falling back to userspace-only
/// filtering when the program cannot be built.
fn kernel_program(criteria: &FilterCriteria) -> Option<Vec<filter::bpf_insn>> {
    match filter::compile(criteria) {
        Ok(Some(program)) => {
            log::info!("Kernel filter: {} instructions", program.len());
            Some(program)
        }
        Ok(None) => {
            log::info!("Open filter, no kernel program installed");
            None
        }
        Err(e) => {
            log::warn!("Kernel filter not installed: {e} (filtering in userspace only)");
            None
        }
    }
}

fn describe(criteria: &FilterCriteria) -> String {
    if criteria.is_open() {
        return "open".to_string();
    }
    format!(
        "protocols={} src_ips={} dst_ips={} src_ports={} dst_ports={}",
        criteria.protocols.len(),
        criteria.src_ips.len(),
        criteria.dst_ips.len(),
        criteria.src_ports.len(),
        criteria.dst_ports.len()
    )
}
