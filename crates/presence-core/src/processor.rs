//! Mesh inbound processing.
//!
//! Bytes arrive from the mesh in arbitrary chunks. The processor buffers
//! them, decodes whole frames and fans each event out to its room. A frame
//! that fails to decode is logged and skipped; the stream keeps going.

use crate::context::RelayContext;
use bytes::{Buf, BytesMut};
use presence_protocol::codec::{self, CodecError, LENGTH_PREFIX_SIZE};
use presence_protocol::PresenceEvent;
use std::sync::Arc;
use tracing::{debug, warn};

/// Counts from one [`InboundProcessor::feed`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSummary {
    /// Events decoded and broadcast.
    pub dispatched: usize,
    /// Frames that failed to decode.
    pub dropped: usize,
}

/// Decodes the mesh inbound stream and broadcasts to local rooms.
pub struct InboundProcessor {
    ctx: Arc<RelayContext>,
    buffer: BytesMut,
    /// Body bytes of an oversized frame still to be discarded.
    skip_remaining: usize,
}

impl InboundProcessor {
    #[must_use]
    pub fn new(ctx: Arc<RelayContext>) -> Self {
        Self {
            ctx,
            buffer: BytesMut::with_capacity(8 * 1024),
            skip_remaining: 0,
        }
    }

    /// Bytes buffered but not yet forming a whole frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Discard any partial frame. Called when the mesh connection is replaced.
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() || self.skip_remaining > 0 {
            debug!(
                bytes = self.buffer.len(),
                skipping = self.skip_remaining,
                "Discarding partial mesh frame"
            );
        }
        self.buffer.clear();
        self.skip_remaining = 0;
    }

    /// Append a chunk from the mesh and dispatch every complete frame.
    pub fn feed(&mut self, mut chunk: &[u8]) -> FeedSummary {
        let mut summary = FeedSummary::default();

        loop {
            if self.skip_remaining > 0 {
                let n = self.skip_remaining.min(chunk.len());
                chunk = &chunk[n..];
                self.skip_remaining -= n;
                if self.skip_remaining > 0 {
                    break;
                }
            }
            self.buffer.extend_from_slice(chunk);
            chunk = &[];

            match self.drain_frames(&mut summary) {
                None => break,
                Some(length) => {
                    // Part of the oversized body may already be buffered
                    let buffered = length.min(self.buffer.len());
                    self.buffer.advance(buffered);
                    self.skip_remaining = length - buffered;
                }
            }
        }
        summary
    }

    /// Decode every complete frame in the buffer. Returns the body length
    /// of an oversized frame whose header was just consumed.
    fn drain_frames(&mut self, summary: &mut FeedSummary) -> Option<usize> {
        loop {
            match codec::decode_from(&mut self.buffer) {
                Ok(Some(event)) => {
                    self.dispatch(event);
                    summary.dispatched += 1;
                }
                Ok(None) => return None,
                Err(CodecError::FrameTooLarge(length)) => {
                    warn!(length, "Skipping oversized mesh frame");
                    summary.dropped += 1;
                    self.buffer.advance(LENGTH_PREFIX_SIZE);
                    return Some(length);
                }
                Err(e) => {
                    warn!(error = %e, "Dropping undecodable mesh frame");
                    summary.dropped += 1;
                }
            }
        }
    }

    /// Broadcast one decoded event to its room.
    pub fn dispatch(&self, event: PresenceEvent) {
        self.ctx.broadcaster.deliver(event);
    }
}

impl std::fmt::Debug for InboundProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundProcessor")
            .field("pending", &self.buffer.len())
            .field("skip_remaining", &self.skip_remaining)
            .finish_non_exhaustive()
    }
}
