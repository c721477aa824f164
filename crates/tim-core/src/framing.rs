use crate::protocol::StructuredMessage;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Encode one message as an NDJSON line (trailing `\n` included).
pub fn encode_line(message: &StructuredMessage) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(message).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > DEFAULT_MAX_FRAME_BYTES {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: DEFAULT_MAX_FRAME_BYTES,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

/// Decode one line (with or without the trailing newline). Unknown `type`
/// tags and malformed JSON both surface as `FrameError::Decode`; callers log
/// and drop rather than tearing the connection down.
pub fn decode_line(bytes: &[u8]) -> Result<StructuredMessage, FrameError> {
    let mut raw = bytes;
    if raw.ends_with(b"\n") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.ends_with(b"\r") {
        raw = &raw[..raw.len() - 1];
    }
    if raw.len() > DEFAULT_MAX_FRAME_BYTES {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: DEFAULT_MAX_FRAME_BYTES,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[derive(Debug, Clone, Default)]
pub struct DecodeReport {
    pub frames: Vec<StructuredMessage>,
    pub errors: Vec<FrameError>,
}

/// Incremental NDJSON decoder for chunked stream input. Recovers after
/// malformed lines and bounds the amount of undelimited input it will hold.
#[derive(Debug)]
pub struct NdjsonDecoder {
    max_frame_bytes: usize,
    pending: Vec<u8>,
}

impl Default for NdjsonDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl NdjsonDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        if !chunk.is_empty() {
            self.pending.extend_from_slice(chunk);
        }

        while let Some(newline_idx) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=newline_idx).collect::<Vec<u8>>();
            if line.iter().all(|byte| byte.is_ascii_whitespace()) {
                continue;
            }
            self.decode_into(&line, &mut report);
        }

        if self.pending.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: self.max_frame_bytes,
            });
            self.pending.clear();
        }

        report
    }

    /// Decode whatever is left once the stream has ended.
    pub fn finish(&mut self) -> DecodeReport {
        let mut report = DecodeReport::default();
        if self.pending.is_empty() {
            return report;
        }
        let rest = std::mem::take(&mut self.pending);
        if !rest.iter().all(|byte| byte.is_ascii_whitespace()) {
            self.decode_into(&rest, &mut report);
        }
        report
    }

    fn decode_into(&self, line: &[u8], report: &mut DecodeReport) {
        if line.len() > self.max_frame_bytes {
            report.errors.push(FrameError::OversizedFrame {
                size: line.len(),
                max: self.max_frame_bytes,
            });
            return;
        }
        match decode_line(line) {
            Ok(frame) => report.frames.push(frame),
            Err(err) => report.errors.push(err),
        }
    }
}
