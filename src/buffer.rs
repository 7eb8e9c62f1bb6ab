use std::collections::VecDeque;

pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Upper bound on the bytes scanned for an exit snapshot.
pub const TAIL_BYTE_LIMIT: usize = 64 * 1024;

/// Ordered log of output chunks, bounded by chunk count.
///
/// Each write event from the process is stored as received. When the log is
/// full the oldest chunk is evicted; the remaining chunks keep their order.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    chunks: VecDeque<Vec<u8>>,
    capacity: usize,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_CAPACITY)
    }
}

impl OutputBuffer {
    /// A zero capacity is raised to one chunk.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: VecDeque::with_capacity(capacity.min(DEFAULT_BUFFER_CAPACITY)),
            capacity,
        }
    }

    /// Appends a chunk, returning how many chunks were evicted from the head.
    pub fn append(&mut self, chunk: Vec<u8>) -> usize {
        self.chunks.push_back(chunk);
        let mut evicted = 0;
        while self.chunks.len() > self.capacity {
            self.chunks.pop_front();
            evicted += 1;
        }
        evicted
    }

    /// Current contents in insertion order. Does not consume.
    pub fn replay(&self) -> Vec<Vec<u8>> {
        self.chunks.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.chunks.iter().map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The last `max_lines` lines of buffered output, decoded lossily.
    /// A trailing partial line counts as a line. At most `TAIL_BYTE_LIMIT`
    /// bytes from the end of the buffer are considered.
    pub fn tail_lines(&self, max_lines: usize) -> Vec<String> {
        if max_lines == 0 {
            return Vec::new();
        }
        let mut newlines = 0;
        let mut taken = 0;
        let mut start = self.chunks.len();
        for chunk in self.chunks.iter().rev() {
            if newlines > max_lines || taken >= TAIL_BYTE_LIMIT {
                break;
            }
            newlines += chunk.iter().filter(|b| **b == b'\n').count();
            taken += chunk.len();
            start -= 1;
        }

        let mut bytes = Vec::with_capacity(taken);
        for chunk in self.chunks.range(start..) {
            bytes.extend_from_slice(chunk);
        }
        let tail = &bytes[bytes.len().saturating_sub(TAIL_BYTE_LIMIT)..];
        let text = String::from_utf8_lossy(tail);
        let lines: Vec<&str> = text.lines().collect();
        let skip = lines.len().saturating_sub(max_lines);
        lines[skip..].iter().map(|l| l.to_string()).collect()
    }
}
