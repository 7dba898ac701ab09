//! Background readers of process output streams.
//!
//! Each output stream of a channel gets its own thread doing blocking reads and pushing the chunks
//! into a queue shared with the process handle. The readers never interpret the data.

use crate::transport::StreamId;
use log::debug;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const READ_CHUNK_SIZE: usize = 4096;

/// Pause between reads of a stream in non-blocking mode that had no data.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A piece of output or the indication that the stream was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Chunk {
    Data(Vec<u8>),
    Closed,
}

pub(crate) type QueueItem = (StreamId, Chunk);

/// Starts a reader thread for stream `id`.
///
/// The thread pushes `(id, Chunk::Data(..))` items until the stream ends, then pushes exactly one
/// `(id, Chunk::Closed)` item and exits. Setting `stop` makes it exit at the next opportunity.
pub(crate) fn spawn_reader(
    id: StreamId,
    mut stream: Box<dyn Read + Send>,
    queue: Sender<QueueItem>,
    stop: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("hostexec-{}", id.name()))
        .spawn(move || {
            let mut buf = vec![0u8; READ_CHUNK_SIZE];
            while !stop.load(Ordering::Relaxed) {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if queue.send((id, Chunk::Data(buf[..n].to_vec()))).is_err() {
                            // Nobody is listening anymore.
                            return;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) => {
                        debug!("failed to read from {}: {}", id.name(), e);
                        break;
                    }
                }
            }
            let _ = queue.send((id, Chunk::Closed));
        })
}

/// Incremental UTF-8 decoder which keeps incomplete multi-byte sequences between chunks.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    /// Decodes `chunk`, holding back a trailing incomplete character. Invalid sequences are
    /// replaced with U+FFFD.
    pub(crate) fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = &bytes[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Returns whatever is left once the stream is over.
    pub(crate) fn finish(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&carry).into_owned()
    }
}
