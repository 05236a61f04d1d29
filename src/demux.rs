// src/demux.rs
//
// =============================================================================
// CRUCIBLE: ATTACH STREAM DEMULTIPLEXER
// =============================================================================
//
// The container runtime multiplexes stdout and stderr onto one byte stream.
// Wire format, frames back-to-back:
//
//   byte 0      stream tag (1 = stdout, 2 = stderr)
//   bytes 1-3   reserved
//   bytes 4-7   payload length, big-endian u32
//   bytes 8..   payload
//
// The parser is incremental: chunks arrive with arbitrary boundaries, a
// frame may span many chunks and a chunk may hold many frames. Unknown tags
// are skipped, a trailing partial frame is dropped, and the output cap is
// applied as payloads are appended. Parsing never fails.

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;

const HEADER_LEN: usize = 8;
const TAG_STDOUT: u8 = 1;
const TAG_STDERR: u8 = 2;

/// Raw multiplexed bytes as delivered by the runtime's attach endpoint.
pub type AttachStream = BoxStream<'static, std::io::Result<Bytes>>;

pub struct StreamDemux {
    cap: usize,
    pending: Vec<u8>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl StreamDemux {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            pending: Vec::new(),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    /// Consume one chunk, extracting every complete frame it finishes.
    /// Whatever remains is kept for the next chunk.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);

        let mut offset = 0;
        while self.pending.len() - offset >= HEADER_LEN {
            let header = &self.pending[offset..offset + HEADER_LEN];
            let payload_len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

            if self.pending.len() - offset < HEADER_LEN + payload_len {
                break; // frame not complete yet
            }

            let payload_start = offset + HEADER_LEN;
            let tag = header[0];
            match tag {
                TAG_STDOUT => append_capped(
                    &mut self.stdout,
                    &self.pending[payload_start..payload_start + payload_len],
                    self.cap,
                ),
                TAG_STDERR => append_capped(
                    &mut self.stderr,
                    &self.pending[payload_start..payload_start + payload_len],
                    self.cap,
                ),
                _ => {} // unknown tag: discard payload
            }
            offset = payload_start + payload_len;
        }

        if offset > 0 {
            self.pending.drain(..offset);
        }
    }

    /// Final buffers. Any incomplete trailing frame is discarded here by
    /// construction: it never made it past `feed`.
    pub fn into_buffers(self) -> (Vec<u8>, Vec<u8>) {
        (self.stdout, self.stderr)
    }
}

/// Append at most `cap - buf.len()` bytes: first-N truncation, silent.
fn append_capped(buf: &mut Vec<u8>, payload: &[u8], cap: usize) {
    let room = cap.saturating_sub(buf.len());
    let take = room.min(payload.len());
    buf.extend_from_slice(&payload[..take]);
}

/// Reader-task body: drains the attach stream to completion and returns the
/// demultiplexed buffers. Stream errors end the drain (the producer is gone);
/// whatever was decoded up to that point stands.
pub async fn drain_attach(mut stream: AttachStream, cap: usize) -> (Vec<u8>, Vec<u8>) {
    let mut demux = StreamDemux::new(cap);
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => demux.feed(&bytes),
            Err(e) => {
                log::debug!("attach stream closed with error: {}", e);
                break;
            }
        }
    }
    demux.into_buffers()
}

// ============================================================================
// TESTS
// ============================================================================
