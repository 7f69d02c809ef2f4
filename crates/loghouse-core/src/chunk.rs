//! Chunking engine
//!
//! Appends arrive as arbitrarily long batches of lines; storage wants
//! bounded-size units. [`group_lines`] partitions a batch into chunks
//! whose serialized size never exceeds the configured bound, without ever
//! reordering, splitting, or dropping a line.
//!
//! The partition is a pure function of the line sizes and the bound, so
//! the number of chunks it produces is exactly the number of sequence
//! numbers the caller must reserve before inserting.

use crate::error::{Error, Result};
use crate::line::LogLine;

/// The lines destined for one stored chunk, in append order.
///
/// A payload has no sequence number yet; the storage layer assigns one
/// when the owner's counter is reserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPayload {
    pub lines: Vec<LogLine>,
}

impl ChunkPayload {
    pub fn size_bytes(&self) -> usize {
        self.lines.iter().map(LogLine::size_bytes).sum()
    }
}

/// Partition `lines` into chunks of at most `max_bytes` serialized size.
///
/// Lines are accumulated in input order; a chunk is closed when the next
/// line would push it past the bound. A single line larger than the bound
/// can never be stored and fails the whole call with
/// [`Error::LineTooLarge`], producing zero chunks.
pub fn group_lines(lines: Vec<LogLine>, max_bytes: usize) -> Result<Vec<ChunkPayload>> {
    let mut chunks = Vec::new();
    let mut current: Vec<LogLine> = Vec::new();
    let mut running = 0usize;

    for line in lines {
        let size = line.size_bytes();
        if size > max_bytes {
            return Err(Error::LineTooLarge {
                size,
                max: max_bytes,
            });
        }

        if running + size > max_bytes && !current.is_empty() {
            chunks.push(ChunkPayload {
                lines: std::mem::take(&mut current),
            });
            running = 0;
        }

        running += size;
        current.push(line);
    }

    if !current.is_empty() {
        chunks.push(ChunkPayload { lines: current });
    }

    Ok(chunks)
}
