// src/sstable/mod.rs

//! Immutable sorted files backing a tablet.
//!
//! This is the default storage format served by [`crate::opener::SstableOpener`].
//! The file manager never looks inside it; it only needs readers that can seek,
//! spawn deep copies and be closed.
//!
//! ## File Format
//!
//! ```text
//! +---------------------------+
//! | Data Block 1              |  ← ~4KB, prefix-compressed rows
//! +---------------------------+
//! | ...                       |
//! +---------------------------+
//! | Data Block N              |
//! +---------------------------+
//! | Index Block               |  ← last key, offset and size of each block
//! +---------------------------+
//! | index_offset:u64          |
//! | index_len:u64             |
//! | magic:u32                 |
//! +---------------------------+
//! ```
//!
//! ### Block Entry Format
//! ```text
//! +--------------+----------------+-------------+------------+-----------+-------+
//! |shared_len:u16|unshared_len:u16|value_len:u32|timestamp:u64|row suffix| value |
//! +--------------+----------------+-------------+------------+-----------+-------+
//! ```
//!
//! Every block and the index end with a CRC-64 of their preceding bytes.

use crc::{Crc, CRC_64_ECMA_182};

mod index;

pub mod block;
pub mod table;

pub use table::{TableInfo, TableReader, TableWriter};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

pub(crate) fn checksum(data: &[u8]) -> u64 {
    CRC64.checksum(data)
}
