//! Reporting of matched frames.

pub mod json;
pub mod text;

use std::io::Write;

use clap::ValueEnum;

use crate::error::SniffError;
use crate::packet::DecodedFrame;

pub use json::JsonReporter;
pub use text::TextReporter;

/// One frame that passed the filter, with its fully decoded header chain.
#[derive(Debug, Clone, Copy)]
pub struct MatchedFrame<'a> {
    /// 1-based position among matched frames of this run.
    pub seq: u64,
    pub timestamp_us: Option<u64>,
    pub headers: DecodedFrame,
    pub raw: &'a [u8],
}

/// Receives matched frames in arrival order.
pub trait Reporter {
    fn report(&mut self, frame: &MatchedFrame<'_>) -> Result<(), SniffError>;

    fn flush(&mut self) -> Result<(), SniffError> {
        Ok(())
    }
}

impl<R: Reporter + ?Sized> Reporter for &mut R {
    fn report(&mut self, frame: &MatchedFrame<'_>) -> Result<(), SniffError> {
        (**self).report(frame)
    }

    fn flush(&mut self) -> Result<(), SniffError> {
        (**self).flush()
    }
}

impl<R: Reporter + ?Sized> Reporter for Box<R> {
    fn report(&mut self, frame: &MatchedFrame<'_>) -> Result<(), SniffError> {
        (**self).report(frame)
    }

    fn flush(&mut self) -> Result<(), SniffError> {
        (**self).flush()
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Build the reporter for `format` writing to `writer`.
pub fn reporter<W: Write + 'static>(format: OutputFormat, writer: W) -> Box<dyn Reporter> {
    match format {
        OutputFormat::Text => Box::new(TextReporter::new(writer)),
        OutputFormat::Json => Box::new(JsonReporter::new(writer)),
    }
}
