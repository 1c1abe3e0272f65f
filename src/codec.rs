//! NDJSON framing for peer sockets and sub-kernel pipes.
//!
//! One JSON document per `\n`-terminated line. Blank lines are keep-alives
//! and never reach the caller. Inbound lines are capped so a peer or child
//! that never sends a newline cannot make the kernel buffer without bound;
//! outbound items must not contain a newline of their own.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Default inbound line limit: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Line codec used by every NDJSON stream in the kernel.
#[derive(Debug)]
pub struct LineCodec {
    lines: LinesCodec,
    max_length: usize,
}

impl LineCodec {
    /// Codec with the [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Codec rejecting inbound lines longer than `max_length` bytes.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_length),
            max_length,
        }
    }

    /// Inbound line limit in bytes.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn next_document(&mut self, src: &mut BytesMut, eof: bool) -> Result<Option<String>> {
        loop {
            let line = if eof {
                self.lines.decode_eof(src)
            } else {
                self.lines.decode(src)
            };
            match line.map_err(|err| self.framing_error(err))? {
                Some(line) if line.trim().is_empty() => {}
                other => return Ok(other),
            }
        }
    }

    fn framing_error(&self, err: LinesCodecError) -> AppError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => AppError::Protocol(format!(
                "frame exceeds {} bytes without a newline",
                self.max_length
            )),
            LinesCodecError::Io(err) => AppError::Io(err.to_string()),
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_document(src, false)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.next_document(src, true)
    }
}

impl Encoder<String> for LineCodec {
    type Error = AppError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<()> {
        if item.contains('\n') {
            return Err(AppError::Protocol(
                "outbound frame contains a raw newline".into(),
            ));
        }
        self.lines
            .encode(item, dst)
            .map_err(|err| self.framing_error(err))
    }
}
