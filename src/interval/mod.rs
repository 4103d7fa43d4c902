//! Interval contract for the history tree
//!
//! The tree never looks inside an interval's payload. It only needs the time
//! bounds, the number of bytes the interval occupies in a node block, and a
//! way to write and re-read those bytes.

mod state;

pub use state::{StateInterval, StateValue};

use std::fmt;
use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// Timestamps are signed 64-bit integers (nanoseconds in trace analysis)
pub type Timestamp = i64;

/// Anything that can be stored in a history tree node
pub trait HtInterval: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Inclusive start time
    fn start(&self) -> Timestamp;

    /// Inclusive end time, fixed at construction
    fn end(&self) -> Timestamp;

    /// Exact number of bytes `write_to` appends
    fn size_on_disk(&self) -> usize;

    /// Append the serialized form to `buf`
    fn write_to(&self, buf: &mut Vec<u8>) -> io::Result<()>;

    /// Decode one interval from the front of `buf`, advancing it
    fn read_from(buf: &mut &[u8]) -> io::Result<Self>;

    /// Whether `t` falls inside `[start, end]`
    fn contains(&self, t: Timestamp) -> bool {
        self.start() <= t && t <= self.end()
    }
}

/// A bare time range with a fixed 16-byte encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct TimeRange {
    /// Range start (inclusive)
    pub start: Timestamp,
    /// Range end (inclusive)
    pub end: Timestamp,
}

/// Encoded size of a [`TimeRange`]
pub const TIME_RANGE_SIZE: usize = 16;

impl TimeRange {
    /// Create a time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Length of the range
    pub fn duration(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }
}

impl HtInterval for TimeRange {
    fn start(&self) -> Timestamp {
        self.start
    }

    fn end(&self) -> Timestamp {
        self.end
    }

    fn size_on_disk(&self) -> usize {
        TIME_RANGE_SIZE
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.write_i64::<LittleEndian>(self.start)?;
        buf.write_i64::<LittleEndian>(self.end)?;
        Ok(())
    }

    fn read_from(buf: &mut &[u8]) -> io::Result<Self> {
        let start = buf.read_i64::<LittleEndian>()?;
        let end = buf.read_i64::<LittleEndian>()?;
        Ok(Self { start, end })
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_codec() {
        let range = TimeRange::new(-5, 1_000_000_000);
        let mut buf = Vec::new();
        range.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), range.size_on_disk());

        let mut cursor = buf.as_slice();
        let decoded = TimeRange::read_from(&mut cursor).unwrap();
        assert_eq!(decoded, range);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_time_range_contains() {
        let range = TimeRange::new(10, 20);
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(9));
        assert!(!range.contains(21));
        assert_eq!(range.duration(), 10);
    }

    #[test]
    fn test_truncated_time_range() {
        let mut cursor: &[u8] = &[1, 2, 3];
        let err = TimeRange::read_from(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
