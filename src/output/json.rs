use std::io::Write;

use serde::Serialize;

use crate::error::SniffError;
use crate::packet::DecodedFrame;

use super::{MatchedFrame, Reporter};

/// JSON-lines reporter: one object per matched frame.
pub struct JsonReporter<W: Write> {
    writer: W,
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    seq: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp_us: Option<u64>,
    len: usize,
    #[serde(flatten)]
    headers: &'a DecodedFrame,
}

impl<W: Write> JsonReporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Reporter for JsonReporter<W> {
    fn report(&mut self, frame: &MatchedFrame<'_>) -> Result<(), SniffError> {
        let record = JsonRecord {
            seq: frame.seq,
            timestamp_us: frame.timestamp_us,
            len: frame.raw.len(),
            headers: &frame.headers,
        };
        serde_json::to_writer(&mut self.writer, &record)
            .map_err(|e| SniffError::Output(std::io::Error::other(e)))?;
        self.writer.write_all(b"\n").map_err(SniffError::Output)
    }

    fn flush(&mut self) -> Result<(), SniffError> {
        self.writer.flush().map_err(SniffError::Output)
    }
}
