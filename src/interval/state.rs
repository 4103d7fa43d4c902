//! Attribute state intervals with variable-size values
//!
//! Layout (little-endian): start (8) | end (8) | attribute (4) | tag (1) | value.
//! Strings are prefixed with a u16 byte length, so a string interval's size
//! depends on its content and node fill levels vary from block to block.

use std::fmt;
use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{HtInterval, Timestamp};

/// Bytes taken by every state interval before its value
pub const STATE_INTERVAL_FIXED_SIZE: usize = 8 + 8 + 4 + 1;

const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_STRING: u8 = 4;

/// Value an attribute holds for the duration of an interval
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub enum StateValue {
    /// No value
    Null,
    /// 32-bit integer
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// Double-precision float
    Double(f64),
    /// UTF-8 string, at most `u16::MAX` bytes
    Str(String),
}

impl StateValue {
    fn tag(&self) -> u8 {
        match self {
            StateValue::Null => TAG_NULL,
            StateValue::Int(_) => TAG_INT,
            StateValue::Long(_) => TAG_LONG,
            StateValue::Double(_) => TAG_DOUBLE,
            StateValue::Str(_) => TAG_STRING,
        }
    }

    /// Encoded size of the value, excluding its tag
    pub fn encoded_size(&self) -> usize {
        match self {
            StateValue::Null => 0,
            StateValue::Int(_) => 4,
            StateValue::Long(_) | StateValue::Double(_) => 8,
            StateValue::Str(s) => 2 + s.len(),
        }
    }
}

/// An attribute's value over `[start, end]`
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialization", derive(serde::Serialize, serde::Deserialize))]
pub struct StateInterval {
    /// Interval start (inclusive)
    pub start: Timestamp,
    /// Interval end (inclusive)
    pub end: Timestamp,
    /// Integer handle of the attribute
    pub attribute: i32,
    /// Value held during the interval
    pub value: StateValue,
}

impl StateInterval {
    /// Create a state interval
    pub fn new(start: Timestamp, end: Timestamp, attribute: i32, value: StateValue) -> Self {
        Self {
            start,
            end,
            attribute,
            value,
        }
    }
}

impl HtInterval for StateInterval {
    fn start(&self) -> Timestamp {
        self.start
    }

    fn end(&self) -> Timestamp {
        self.end
    }

    fn size_on_disk(&self) -> usize {
        STATE_INTERVAL_FIXED_SIZE + self.value.encoded_size()
    }

    fn write_to(&self, buf: &mut Vec<u8>) -> io::Result<()> {
        buf.write_i64::<LittleEndian>(self.start)?;
        buf.write_i64::<LittleEndian>(self.end)?;
        buf.write_i32::<LittleEndian>(self.attribute)?;
        buf.write_u8(self.value.tag())?;
        match &self.value {
            StateValue::Null => {}
            StateValue::Int(v) => buf.write_i32::<LittleEndian>(*v)?,
            StateValue::Long(v) => buf.write_i64::<LittleEndian>(*v)?,
            StateValue::Double(v) => buf.write_f64::<LittleEndian>(*v)?,
            StateValue::Str(s) => {
                let len = u16::try_from(s.len()).map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("string value of {} bytes exceeds {}", s.len(), u16::MAX),
                    )
                })?;
                buf.write_u16::<LittleEndian>(len)?;
                buf.extend_from_slice(s.as_bytes());
            }
        }
        Ok(())
    }

    fn read_from(buf: &mut &[u8]) -> io::Result<Self> {
        let start = buf.read_i64::<LittleEndian>()?;
        let end = buf.read_i64::<LittleEndian>()?;
        let attribute = buf.read_i32::<LittleEndian>()?;
        let value = match buf.read_u8()? {
            TAG_NULL => StateValue::Null,
            TAG_INT => StateValue::Int(buf.read_i32::<LittleEndian>()?),
            TAG_LONG => StateValue::Long(buf.read_i64::<LittleEndian>()?),
            TAG_DOUBLE => StateValue::Double(buf.read_f64::<LittleEndian>()?),
            TAG_STRING => {
                let len = buf.read_u16::<LittleEndian>()? as usize;
                let mut bytes = vec![0u8; len];
                buf.read_exact(&mut bytes)?;
                let s = String::from_utf8(bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                StateValue::Str(s)
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown state value tag {}", other),
                ));
            }
        };
        Ok(Self {
            start,
            end,
            attribute,
            value,
        })
    }
}

impl fmt::Display for StateInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}], attribute = {}, value = {:?}",
            self.start, self.end, self.attribute, self.value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(interval: &StateInterval) -> Vec<u8> {
        let mut buf = Vec::new();
        interval.write_to(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_sizes_follow_values() {
        let values = [
            (StateValue::Null, 21),
            (StateValue::Int(7), 25),
            (StateValue::Long(7), 29),
            (StateValue::Double(1.5), 29),
            (StateValue::Str("running".to_string()), 30),
        ];

        for (value, expected) in values {
            let interval = StateInterval::new(1, 2, 3, value);
            assert_eq!(interval.size_on_disk(), expected);
            assert_eq!(encode(&interval).len(), expected);
        }
    }

    #[test]
    fn test_string_interval_codec() {
        let interval = StateInterval::new(100, 250, 42, StateValue::Str("syscall_entry_open".into()));
        let bytes = encode(&interval);

        let mut cursor = bytes.as_slice();
        let decoded = StateInterval::read_from(&mut cursor).unwrap();
        assert_eq!(decoded, interval);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_consecutive_intervals_share_a_buffer() {
        let first = StateInterval::new(0, 9, 1, StateValue::Int(-1));
        let second = StateInterval::new(10, 19, 2, StateValue::Null);
        let mut buf = encode(&first);
        second.write_to(&mut buf).unwrap();

        let mut cursor = buf.as_slice();
        assert_eq!(StateInterval::read_from(&mut cursor).unwrap(), first);
        assert_eq!(StateInterval::read_from(&mut cursor).unwrap(), second);
    }

    #[test]
    fn test_unknown_tag_is_invalid_data() {
        let mut bytes = encode(&StateInterval::new(0, 1, 0, StateValue::Null));
        bytes[20] = 99;
        let err = StateInterval::read_from(&mut bytes.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_oversized_string_is_rejected() {
        let huge = "x".repeat(u16::MAX as usize + 1);
        let interval = StateInterval::new(0, 1, 0, StateValue::Str(huge));
        let mut buf = Vec::new();
        let err = interval.write_to(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
