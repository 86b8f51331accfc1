use std::{cmp::Ordering, sync::Arc};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::checksum;
use crate::error::{Error, Result};
use crate::iterator::Value;
use crate::key::Key;

const RESTART_INTERVAL: usize = 16;

/// Size of the fixed part of an entry header.
const ENTRY_HEADER_SIZE: usize = 16;

/// Size of the trailer: restart count plus checksum.
const TRAILER_SIZE: usize = 12;

pub struct Builder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_row: Vec<u8>,
}

impl Builder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_row: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, key: &Key, value: &[u8]) -> Result<()> {
        let shared_len = if self.entry_count % RESTART_INTERVAL == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
            0
        } else {
            shared_prefix_length(&self.last_row, &key.row)
        };
        let unshared_len = key.row.len() - shared_len;

        self.buffer.write_u16::<BigEndian>(shared_len as u16)?;
        self.buffer.write_u16::<BigEndian>(unshared_len as u16)?;
        self.buffer.write_u32::<BigEndian>(value.len() as u32)?;
        self.buffer.write_u64::<BigEndian>(key.timestamp)?;
        self.buffer.extend_from_slice(&key.row[shared_len..]);
        self.buffer.extend_from_slice(value);

        self.last_row.clear();
        self.last_row.extend_from_slice(&key.row);
        self.entry_count += 1;
        Ok(())
    }

    /// Encoded size if the block were finished now.
    pub fn size_estimate(&self) -> usize {
        self.buffer.len() + self.restart_positions.len() * 4 + TRAILER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn finish(mut self) -> Result<Vec<u8>> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos)?;
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)?;
        let crc = checksum(&self.buffer);
        self.buffer.write_u64::<BigEndian>(crc)?;
        Ok(self.buffer)
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .zip(b.iter())
        .take_while(|&(a, b)| a == b)
        .count()
        .min(u16::MAX as usize)
}

/// A decoded data block. The raw bytes are shared with the block cache.
pub struct Block {
    raw: Arc<Vec<u8>>,
    data_len: usize,
    restart_positions: Vec<u32>,
}

impl Block {
    pub fn decode(raw: Arc<Vec<u8>>) -> Result<Self> {
        let len = raw.len();
        if len < TRAILER_SIZE {
            return Err(Error::Corruption("block shorter than its trailer".into()));
        }

        let stored_crc = (&raw[len - 8..]).read_u64::<BigEndian>()?;
        if checksum(&raw[..len - 8]) != stored_crc {
            return Err(Error::ChecksumMismatch);
        }

        let num_restarts = (&raw[len - TRAILER_SIZE..]).read_u32::<BigEndian>()? as usize;
        let restarts_size = num_restarts * 4;
        if len - TRAILER_SIZE < restarts_size {
            return Err(Error::Corruption(
                "block too short for restart positions".into(),
            ));
        }

        let data_len = len - TRAILER_SIZE - restarts_size;
        let mut cursor = &raw[data_len..len - TRAILER_SIZE];
        let mut restart_positions = Vec::with_capacity(num_restarts);
        for _ in 0..num_restarts {
            let pos = cursor.read_u32::<BigEndian>()?;
            if pos as usize >= data_len {
                return Err(Error::Corruption("restart position out of bounds".into()));
            }
            restart_positions.push(pos);
        }

        Ok(Self {
            raw,
            data_len,
            restart_positions,
        })
    }

    fn data(&self) -> &[u8] {
        &self.raw[..self.data_len]
    }

    /// Decodes the entry at `offset`, returning it and the offset of the next one.
    fn read_entry_at(&self, offset: usize, prev_row: &[u8]) -> Result<(Key, Value, usize)> {
        let data = self.data();
        if offset + ENTRY_HEADER_SIZE > data.len() {
            return Err(Error::Corruption("block entry header out of bounds".into()));
        }

        let mut header = &data[offset..offset + ENTRY_HEADER_SIZE];
        let shared_len = header
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Decode("shared_len", e))? as usize;
        let unshared_len = header
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Decode("unshared_len", e))? as usize;
        let value_len = header
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("value_len", e))? as usize;
        let timestamp = header
            .read_u64::<BigEndian>()
            .map_err(|e| Error::Decode("timestamp", e))?;

        let mut pos = offset + ENTRY_HEADER_SIZE;
        if shared_len > prev_row.len() || pos + unshared_len + value_len > data.len() {
            return Err(Error::Corruption("block entry out of bounds".into()));
        }

        let mut row = Vec::with_capacity(shared_len + unshared_len);
        row.extend_from_slice(&prev_row[..shared_len]);
        row.extend_from_slice(&data[pos..pos + unshared_len]);
        pos += unshared_len;

        let value = data[pos..pos + value_len].to_vec();
        pos += value_len;

        Ok((Key { row, timestamp }, value, pos))
    }
}

/// Cursor over the entries of one block.
pub struct BlockCursor {
    block: Arc<Block>,
    next_offset: usize,
    current: Option<(Key, Value)>,
}

impl BlockCursor {
    /// An unpositioned cursor; call `seek_to_first` or `seek`.
    pub fn new(block: Arc<Block>) -> Self {
        Self {
            block,
            next_offset: 0,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&(Key, Value)> {
        self.current.as_ref()
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.next_offset = 0;
        self.current = None;
        self.advance()
    }

    /// Moves to the next entry, or past the end.
    pub fn advance(&mut self) -> Result<()> {
        if self.next_offset >= self.block.data_len {
            self.current = None;
            return Ok(());
        }

        let prev_row = self.current.as_ref().map_or(&[][..], |(k, _)| &k.row[..]);
        let (key, value, next) = self.block.read_entry_at(self.next_offset, prev_row)?;
        self.current = Some((key, value));
        self.next_offset = next;
        Ok(())
    }

    /// Positions the cursor at the first key >= `target`, or past the end.
    pub fn seek(&mut self, target: &Key) -> Result<()> {
        // Binary search for the last restart point whose key is < target.
        let mut left = 0;
        let mut right = self.block.restart_positions.len();
        while left < right {
            let mid = left + (right - left) / 2;
            let offset = self.block.restart_positions[mid] as usize;
            let (key, _, _) = self.block.read_entry_at(offset, &[])?;
            match key.cmp(target) {
                Ordering::Less => left = mid + 1,
                _ => right = mid,
            }
        }
        let restart_index = left.saturating_sub(1);

        self.next_offset = self
            .block
            .restart_positions
            .get(restart_index)
            .map_or(0, |&p| p as usize);
        self.current = None;
        self.advance()?;

        while matches!(&self.current, Some((key, _)) if key < target) {
            self.advance()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(entries: &[(Key, Vec<u8>)]) -> Arc<Block> {
        let mut builder = Builder::new();
        for (key, value) in entries {
            builder.add_entry(key, value).unwrap();
        }
        Arc::new(Block::decode(Arc::new(builder.finish().unwrap())).unwrap())
    }

    fn sample() -> Vec<(Key, Vec<u8>)> {
        (0..40)
            .map(|i| {
                (
                    Key::new(format!("row_{:03}", i / 2), 10 - (i % 2) as u64),
                    format!("value_{}", i).into_bytes(),
                )
            })
            .collect()
    }

    #[test]
    fn test_block_roundtrip_through_cursor() {
        let entries = sample();
        let mut cursor = BlockCursor::new(build(&entries));

        cursor.seek_to_first().unwrap();
        for expected in &entries {
            assert_eq!(cursor.current(), Some(expected));
            cursor.advance().unwrap();
        }
        assert!(cursor.current().is_none());
    }

    #[test]
    fn test_seek() {
        let entries = sample();
        let mut cursor = BlockCursor::new(build(&entries));

        // Exact match, including the timestamp.
        cursor.seek(&Key::new("row_007", 9)).unwrap();
        assert_eq!(cursor.current().unwrap().0, Key::new("row_007", 9));

        // The first version of a row.
        cursor.seek(&Key::row_start("row_012")).unwrap();
        assert_eq!(cursor.current().unwrap().0, Key::new("row_012", 10));

        // Between rows.
        cursor.seek(&Key::row_start("row_0125")).unwrap();
        assert_eq!(cursor.current().unwrap().0, Key::new("row_013", 10));

        // Past the end.
        cursor.seek(&Key::row_start("zzz")).unwrap();
        assert!(cursor.current().is_none());
    }

    #[test]
    fn test_corrupted_block_rejected() {
        let mut builder = Builder::new();
        builder.add_entry(&Key::new("a", 1), b"v").unwrap();
        let mut raw = builder.finish().unwrap();
        raw[3] ^= 0xff;

        assert!(matches!(
            Block::decode(Arc::new(raw)),
            Err(Error::ChecksumMismatch)
        ));
    }
}
