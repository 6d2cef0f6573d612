//! In-memory record framing for a single batch.
//!
//! Each record is written as
//!
//! ```text
//! ┌──────────────┬─────────┬──────────────┬─────────┐
//! │ key_len: i32 │   key   │ val_len: i32 │  value  │
//! └──────────────┴─────────┴──────────────┴─────────┘
//! ```
//!
//! with `key_len = -1` for records without a key. The buffer comes from the
//! [`crate::pool::BufferPool`] and the builder never holds more bytes than it
//! has reserved there. `write_limit` is a soft bound: the first record always
//! fits, and a builder still under its limit may take one more record past
//! it once the extra bytes are reserved through [`MemoryRecords::grow`].

use bytes::{BufMut, BytesMut};

/// Framing bytes added to every record.
pub const RECORD_OVERHEAD: usize = 8;

/// Framed size of a record.
pub fn record_size(key: Option<&[u8]>, value: &[u8]) -> usize {
    RECORD_OVERHEAD + key.map_or(0, <[u8]>::len) + value.len()
}

#[derive(Debug)]
pub struct MemoryRecords {
    buffer: BytesMut,
    reserved: usize,
    write_limit: usize,
    record_count: u32,
    closed: bool,
}

impl MemoryRecords {
    pub fn new(buffer: BytesMut, write_limit: usize) -> Self {
        let reserved = buffer.capacity();
        Self {
            buffer,
            reserved,
            write_limit,
            record_count: 0,
            closed: false,
        }
    }

    /// Whether a record fits in the reserved bytes. An empty builder accepts anything.
    pub fn has_room_for(&self, key: Option<&[u8]>, value: &[u8]) -> bool {
        if self.closed {
            return false;
        }
        if self.record_count == 0 {
            return true;
        }
        let len = self.buffer.len();
        len < self.write_limit && len + record_size(key, value) <= self.reserved
    }

    /// Extra bytes the builder must reserve to take a record past its soft limit.
    ///
    /// `None` when the record already fits, when the builder is closed, empty
    /// or full, or when the record alone exceeds `write_limit`. Oversized
    /// records always get a batch of their own.
    pub fn overflow_for(&self, key: Option<&[u8]>, value: &[u8]) -> Option<usize> {
        let len = self.buffer.len();
        let size = record_size(key, value);
        if self.closed
            || self.record_count == 0
            || len >= self.write_limit
            || size > self.write_limit
        {
            return None;
        }
        (len + size).checked_sub(self.reserved).filter(|extra| *extra > 0)
    }

    /// Account for `extra` bytes reserved from the pool and size the buffer to match.
    pub fn grow(&mut self, extra: usize) {
        self.reserved += extra;
        if self.buffer.capacity() < self.reserved {
            // `BytesMut::reserve` may round up past the reserved bytes.
            let mut grown = BytesMut::with_capacity(self.reserved);
            grown.extend_from_slice(&self.buffer);
            self.buffer = grown;
        }
    }

    /// Append a framed record. Callers check `has_room_for` first.
    pub fn append(&mut self, key: Option<&[u8]>, value: &[u8]) -> u32 {
        match key {
            Some(k) => {
                self.buffer.put_i32(k.len() as i32);
                self.buffer.put_slice(k);
            }
            None => self.buffer.put_i32(-1),
        }
        self.buffer.put_i32(value.len() as i32);
        self.buffer.put_slice(value);

        let offset = self.record_count;
        self.record_count += 1;
        offset
    }

    pub fn is_full(&self) -> bool {
        self.closed || self.buffer.len() >= self.write_limit
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn size_in_bytes(&self) -> usize {
        self.buffer.len()
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    /// Bytes drawn from the pool; the amount returned on deallocation.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved
    }

    /// Framed bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Take the buffer out, leaving the builder empty and closed.
    pub fn take_buffer(&mut self) -> BytesMut {
        self.closed = true;
        std::mem::take(&mut self.buffer)
    }
}

/// Decode framed records, yielding `(key, value)` pairs.
///
/// Stops at the first malformed frame.
pub fn decode(mut bytes: &[u8]) -> Vec<(Option<Vec<u8>>, Vec<u8>)> {
    fn read_len(bytes: &mut &[u8]) -> Option<i32> {
        let (head, rest) = bytes.split_first_chunk::<4>()?;
        *bytes = rest;
        Some(i32::from_be_bytes(*head))
    }
    fn read_slice(bytes: &mut &[u8], len: usize) -> Option<Vec<u8>> {
        if bytes.len() < len {
            return None;
        }
        let (head, rest) = bytes.split_at(len);
        *bytes = rest;
        Some(head.to_vec())
    }

    let mut out = Vec::new();
    while !bytes.is_empty() {
        let Some(key_len) = read_len(&mut bytes) else { break };
        let key = if key_len < 0 {
            None
        } else {
            match read_slice(&mut bytes, key_len as usize) {
                Some(k) => Some(k),
                None => break,
            }
        };
        let Some(value_len) = read_len(&mut bytes) else { break };
        if value_len < 0 {
            break;
        }
        let Some(value) = read_slice(&mut bytes, value_len as usize) else { break };
        out.push((key, value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size_includes_overhead() {
        assert_eq!(record_size(None, b"ab"), 10);
        assert_eq!(record_size(Some(b"k"), b"ab"), 11);
    }

    #[test]
    fn test_record_must_fit_reserved_bytes() {
        let mut records = MemoryRecords::new(BytesMut::with_capacity(25), 25);
        for _ in 0..2 {
            assert!(records.has_room_for(None, b"ab"));
            records.append(None, b"ab");
            assert!(!records.is_full());
        }
        // 20 written, 10 more would pass the 25 bytes drawn from the pool
        assert!(!records.has_room_for(None, b"ab"));
        assert_eq!(records.overflow_for(None, b"ab"), Some(5));
        assert_eq!(records.reserved_bytes(), 25);
    }

    #[test]
    fn test_grow_admits_one_record_past_the_limit() {
        let mut records = MemoryRecords::new(BytesMut::with_capacity(25), 25);
        records.append(None, b"ab");
        records.append(None, b"ab");

        records.grow(5);
        assert!(records.has_room_for(None, b"ab"));
        records.append(None, b"ab");
        assert_eq!(records.size_in_bytes(), 30);
        assert_eq!(records.reserved_bytes(), 30);
        assert!(records.is_full());
        assert!(!records.has_room_for(None, b"ab"));
        assert_eq!(records.overflow_for(None, b"ab"), None);
        assert_eq!(decode(records.as_bytes()).len(), 3);
    }

    #[test]
    fn test_oversized_record_never_overflows_into_open_builder() {
        let mut records = MemoryRecords::new(BytesMut::with_capacity(100), 100);
        records.append(None, b"v");
        let value = vec![0u8; 5000];
        assert!(!records.has_room_for(None, &value));
        assert_eq!(records.overflow_for(None, &value), None);
    }

    #[test]
    fn test_oversized_first_record_is_accepted() {
        let mut records = MemoryRecords::new(BytesMut::with_capacity(100), 10);
        let value = vec![7u8; 92];
        assert!(records.has_room_for(None, &value));
        assert_eq!(records.append(None, &value), 0);
        assert!(records.is_full());
    }

    #[test]
    fn test_closed_rejects_appends() {
        let mut records = MemoryRecords::new(BytesMut::with_capacity(64), 64);
        records.close();
        assert!(!records.has_room_for(None, b"x"));
        assert!(records.is_full());
    }

    #[test]
    fn test_decode_preserves_order_and_keys() {
        let mut records = MemoryRecords::new(BytesMut::with_capacity(64), 64);
        records.append(Some(b"user-1"), b"first");
        records.append(None, b"second");

        let decoded = decode(records.as_bytes());
        assert_eq!(
            decoded,
            vec![
                (Some(b"user-1".to_vec()), b"first".to_vec()),
                (None, b"second".to_vec()),
            ]
        );
    }

    #[test]
    fn test_decode_stops_at_truncated_frame() {
        let mut records = MemoryRecords::new(BytesMut::with_capacity(64), 64);
        records.append(None, b"whole");
        records.append(None, b"partial");
        let bytes = records.as_bytes();
        assert_eq!(decode(&bytes[..bytes.len() - 3]).len(), 1);
    }
}
