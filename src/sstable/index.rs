//! Sparse index mapping each data block's last key to its location.

use std::convert::TryFrom;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::checksum;
use crate::error::{Error, Result};
use crate::key::Key;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub last_key: Key,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Index {
    /// Sorted by `last_key`, one entry per data block.
    entries: Vec<IndexEntry>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, last_key: Key, offset: u64, size: u64) {
        self.entries.push(IndexEntry {
            last_key,
            offset,
            size,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&IndexEntry> {
        self.entries.get(index)
    }

    /// Index of the first block that may hold a key >= `target`.
    pub fn find(&self, target: &Key) -> Option<usize> {
        let idx = self.entries.partition_point(|e| e.last_key < *target);
        (idx < self.entries.len()).then_some(idx)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u32::<BigEndian>(self.entries.len() as u32)?;
        for entry in &self.entries {
            buf.write_u32::<BigEndian>(entry.last_key.row.len() as u32)?;
            buf.extend_from_slice(&entry.last_key.row);
            buf.write_u64::<BigEndian>(entry.last_key.timestamp)?;
            buf.write_u64::<BigEndian>(entry.offset)?;
            buf.write_u64::<BigEndian>(entry.size)?;
        }
        let crc = checksum(&buf);
        buf.write_u64::<BigEndian>(crc)?;
        Ok(buf)
    }
}

impl TryFrom<&[u8]> for Index {
    type Error = Error;

    fn try_from(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(Error::Corruption("index block too short".into()));
        }
        let (body, mut trailer) = data.split_at(data.len() - 8);
        if checksum(body) != trailer.read_u64::<BigEndian>()? {
            return Err(Error::ChecksumMismatch);
        }

        let mut cursor = body;
        let count = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("index entry count", e))? as usize;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let row_len = cursor
                .read_u32::<BigEndian>()
                .map_err(|e| Error::Decode("index key length", e))? as usize;
            if cursor.len() < row_len {
                return Err(Error::Corruption("index key out of bounds".into()));
            }
            let (row, rest) = cursor.split_at(row_len);
            cursor = rest;

            let timestamp = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Decode("index key timestamp", e))?;
            let offset = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Decode("block offset", e))?;
            let size = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Decode("block size", e))?;

            entries.push(IndexEntry {
                last_key: Key::new(row, timestamp),
                offset,
                size,
            });
        }

        Ok(Self { entries })
    }
}
