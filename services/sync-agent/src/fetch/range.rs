//! Byte-range planning for parallel transfers.

/// An inclusive byte range `[start, end]` within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Ranges are never empty; kept for clippy's `len_without_is_empty`.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for the HTTP `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Split `total` bytes into consecutive, disjoint parts of at most `part_size`.
///
/// Returns an empty plan for an empty file. A `part_size` of zero is treated
/// as one byte so the plan always terminates.
pub fn split_ranges(total: u64, part_size: u64) -> Vec<ByteRange> {
    let part_size = part_size.max(1);
    let mut ranges = Vec::with_capacity(total.div_ceil(part_size) as usize);
    let mut start = 0;
    while start < total {
        let end = (start + part_size).min(total) - 1;
        ranges.push(ByteRange { start, end });
        start = end + 1;
    }
    ranges
}
