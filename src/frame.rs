//! Frame decoding state machine.
//!
//! Extracts fixed-layout frames (header byte, payload, tail byte) from a
//! continuous byte stream. The decoder tolerates leading garbage by
//! scanning for the header and resynchronizes on framing errors by
//! discarding the frame in flight; it never attempts partial recovery
//! mid-payload.
//!
//! One call to [`FrameDecoder::next_frame`] is one decode iteration: it
//! performs bounded reads until a frame completes, a malformed frame is
//! discarded, the resync scan budget is exhausted, or the stream fails.
//! Decoder state persists across calls, so a frame split across two
//! iterations still decodes.

use std::marker::PhantomData;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::error::LinkError;
use crate::protocol::{FRAME_HEADER, FRAME_TAIL};
use crate::sample::SampleFormat;

/// Largest payload across supported formats.
const MAX_PAYLOAD_LEN: usize = 6;

/// Decoder position within the frame layout. Cyclic; there is no terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecoderState {
    /// Scanning for the header byte; anything else is skipped.
    #[default]
    AwaitingHeader,
    /// Header seen, reading the fixed-length payload.
    ReadingPayload,
    /// Payload complete, expecting the tail byte.
    AwaitingTail,
}

/// Byte-oriented frame decoder for one device variant.
pub struct FrameDecoder<F: SampleFormat> {
    state: DecoderState,
    payload: [u8; MAX_PAYLOAD_LEN],
    max_skip_bytes: usize,
    read_timeout: Duration,
    _format: PhantomData<F>,
}

impl<F: SampleFormat> FrameDecoder<F> {
    /// Create a decoder in [`DecoderState::AwaitingHeader`].
    ///
    /// `max_skip_bytes` bounds the resync scan per call; `read_timeout`
    /// bounds every individual read.
    pub fn new(max_skip_bytes: usize, read_timeout: Duration) -> Self {
        debug_assert!(F::PAYLOAD_LEN <= MAX_PAYLOAD_LEN);
        Self {
            state: DecoderState::AwaitingHeader,
            payload: [0; MAX_PAYLOAD_LEN],
            // At least one read per call.
            max_skip_bytes: max_skip_bytes.max(1),
            read_timeout,
            _format: PhantomData,
        }
    }

    /// Current state, primarily for diagnostics.
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Reset to [`DecoderState::AwaitingHeader`], discarding any partial
    /// frame. Called on every streaming start.
    pub fn reset(&mut self) {
        self.state = DecoderState::AwaitingHeader;
    }

    /// Decode until one frame completes or this iteration ends.
    ///
    /// Returns `Ok(Some(sample))` for a valid frame, `Ok(None)` when a
    /// malformed frame was discarded or the skip budget ran out without a
    /// header, and `Err` when the stream closed (zero-byte read), a read
    /// timed out, or I/O failed. Errors are terminal for the streaming
    /// session; the caller must not reuse the transport afterwards.
    pub async fn next_frame<R: AsyncRead + Unpin>(
        &mut self,
        port: &mut R,
    ) -> Result<Option<F::Sample>, LinkError> {
        let mut skipped = 0usize;

        for _ in 0..self.max_skip_bytes {
            match self.state {
                DecoderState::AwaitingHeader => {
                    let byte = self.read_byte(port).await?;
                    if byte == FRAME_HEADER {
                        if skipped > 0 {
                            debug!(skipped, "skipped bytes before frame header");
                        }
                        self.state = DecoderState::ReadingPayload;
                    } else {
                        skipped += 1;
                    }
                }
                DecoderState::ReadingPayload => {
                    self.read_payload(port).await?;
                    self.state = DecoderState::AwaitingTail;
                }
                DecoderState::AwaitingTail => {
                    let byte = self.read_byte(port).await?;
                    self.state = DecoderState::AwaitingHeader;
                    if byte == FRAME_TAIL {
                        trace!("frame complete");
                        return Ok(Some(F::decode(&self.payload[..F::PAYLOAD_LEN])));
                    }
                    debug!(tail = byte, "bad tail byte, frame discarded");
                    return Ok(None);
                }
            }
        }

        debug!(
            budget = self.max_skip_bytes,
            "resync scan budget exhausted without a frame"
        );
        Ok(None)
    }

    async fn read_byte<R: AsyncRead + Unpin>(&self, port: &mut R) -> Result<u8, LinkError> {
        let mut buf = [0u8; 1];
        match tokio::time::timeout(self.read_timeout, port.read(&mut buf)).await {
            Ok(Ok(0)) => Err(LinkError::Disconnected),
            Ok(Ok(_)) => Ok(buf[0]),
            Ok(Err(e)) => Err(LinkError::Io(e)),
            Err(_) => Err(LinkError::Timeout),
        }
    }

    async fn read_payload<R: AsyncRead + Unpin>(&mut self, port: &mut R) -> Result<(), LinkError> {
        let len = F::PAYLOAD_LEN;
        let mut filled = 0usize;
        while filled < len {
            match tokio::time::timeout(self.read_timeout, port.read(&mut self.payload[filled..len]))
                .await
            {
                Ok(Ok(0)) => return Err(LinkError::Disconnected),
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) => return Err(LinkError::Io(e)),
                Err(_) => return Err(LinkError::Timeout),
            }
        }
        Ok(())
    }
}
