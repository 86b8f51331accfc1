// src/sstable/table.rs

//! Writing and reading sorted files.
//!
//! A [`TableWriter`] streams sorted entries into blocks and finishes the file
//! with its index and footer. A [`TableReader`] is one open handle on a
//! finished file: a seekable cursor that can spawn deep copies sharing the same
//! file descriptor, index and block caches.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::block::{Block, BlockCursor, Builder};
use super::index::Index;
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::iterator::{BoxedIterator, FileReader, SortedKvIterator};
use crate::key::{DataFileValue, Key, Range};

/// The target maximum size for a data block.
pub const TARGET_BLOCK_SIZE: usize = 4096;

const MAGIC: u32 = 0x5346_4b56;
const FOOTER_SIZE: u64 = 8 + 8 + 4;

/// Summary of a finished file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInfo {
    pub entries: u64,
    pub size: u64,
}

impl TableInfo {
    pub fn data_file_value(&self) -> DataFileValue {
        DataFileValue::new(self.size, self.entries)
    }
}

pub struct TableWriter {
    file: BufWriter<File>,
    builder: Builder,
    index: Index,
    offset: u64,
    last_key: Option<Key>,
    entries: u64,
    block_size: usize,
}

impl TableWriter {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: BufWriter::new(File::create(path)?),
            builder: Builder::new(),
            index: Index::new(),
            offset: 0,
            last_key: None,
            entries: 0,
            block_size: TARGET_BLOCK_SIZE,
        })
    }

    /// Set the target data block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size.max(1);
        self
    }

    /// Appends an entry. Keys must be strictly increasing.
    pub fn add(&mut self, key: Key, value: &[u8]) -> Result<()> {
        if let Some(last) = &self.last_key {
            if key <= *last {
                return Err(Error::InvalidState(format!(
                    "keys must be added in sorted order: {:?} after {:?}",
                    key, last
                )));
            }
        }

        self.builder.add_entry(&key, value)?;
        self.last_key = Some(key);
        self.entries += 1;

        if self.builder.size_estimate() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.builder.is_empty() {
            return Ok(());
        }
        let Some(last_key) = self.last_key.clone() else {
            return Ok(());
        };

        let builder = std::mem::replace(&mut self.builder, Builder::new());
        let data = builder.finish()?;
        self.file.write_all(&data)?;
        self.index.push(last_key, self.offset, data.len() as u64);
        self.offset += data.len() as u64;
        Ok(())
    }

    pub fn finish(mut self) -> Result<TableInfo> {
        self.flush_block()?;

        let index_data = self.index.encode()?;
        let index_offset = self.offset;
        self.file.write_all(&index_data)?;
        self.file.write_u64::<BigEndian>(index_offset)?;
        self.file.write_u64::<BigEndian>(index_data.len() as u64)?;
        self.file.write_u32::<BigEndian>(MAGIC)?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;

        Ok(TableInfo {
            entries: self.entries,
            size: index_offset + index_data.len() as u64 + FOOTER_SIZE,
        })
    }
}

/// State shared by a reader and all of its deep copies.
struct TableFile {
    name: String,
    /// Taken when the root reader closes, so the descriptor is released even
    /// while deep copies are still alive.
    file: Mutex<Option<File>>,
    index: Index,
    data_cache: Option<Arc<BlockCache>>,
}

impl TableFile {
    fn read_block(&self, idx: usize) -> Result<Arc<Block>> {
        let entry = self
            .index
            .get(idx)
            .ok_or_else(|| Error::Corruption(format!("block {} out of range", idx)))?;

        if let Some(raw) = self
            .data_cache
            .as_ref()
            .and_then(|c| c.get(&self.name, entry.offset))
        {
            return Ok(Arc::new(Block::decode(raw)?));
        }

        let raw = Arc::new(read_at(&self.file, entry.offset, entry.size)?);
        let block = Block::decode(raw.clone())?;
        if let Some(cache) = &self.data_cache {
            cache.insert(&self.name, entry.offset, raw);
        }
        Ok(Arc::new(block))
    }
}

fn read_at(file: &Mutex<Option<File>>, offset: u64, size: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    let mut guard = file.lock().unwrap();
    let file = guard.as_mut().ok_or(Error::Closed)?;
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut buf)?;
    Ok(buf)
}

pub struct TableReader {
    table: Arc<TableFile>,
    range: Range,
    block_idx: usize,
    cursor: Option<BlockCursor>,
    closed: Arc<AtomicBool>,
    /// Close flags of every deep copy spawned from the root reader.
    copies: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
}

impl TableReader {
    /// Opens a finished file and loads its index, through `index_cache` when given.
    pub fn open(
        path: impl AsRef<Path>,
        data_cache: Option<Arc<BlockCache>>,
        index_cache: Option<Arc<BlockCache>>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let name = path.to_string_lossy().into_owned();
        let mut file = File::open(path)?;

        let file_size = file.metadata()?.len();
        if file_size < FOOTER_SIZE {
            return Err(Error::Corruption(format!("{} is too short", name)));
        }
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let index_offset = file.read_u64::<BigEndian>()?;
        let index_len = file.read_u64::<BigEndian>()?;
        if file.read_u32::<BigEndian>()? != MAGIC {
            return Err(Error::Corruption(format!("{} has a bad magic number", name)));
        }
        if index_offset + index_len + FOOTER_SIZE != file_size {
            return Err(Error::Corruption(format!("{} has an invalid footer", name)));
        }

        let file = Mutex::new(Some(file));
        let index_data = match index_cache.as_ref().and_then(|c| c.get(&name, index_offset)) {
            Some(raw) => raw,
            None => {
                let raw = Arc::new(read_at(&file, index_offset, index_len)?);
                if let Some(cache) = &index_cache {
                    cache.insert(&name, index_offset, raw.clone());
                }
                raw
            }
        };
        let index = Index::try_from(index_data.as_slice())?;

        let table = Arc::new(TableFile {
            name,
            file,
            index,
            data_cache,
        });
        Ok(Self::unpositioned(table, Arc::new(Mutex::new(Vec::new()))))
    }

    fn unpositioned(table: Arc<TableFile>, copies: Arc<Mutex<Vec<Arc<AtomicBool>>>>) -> Self {
        let block_idx = table.index.len();
        Self {
            table,
            range: Range::all(),
            block_idx,
            cursor: None,
            closed: Arc::new(AtomicBool::new(false)),
            copies,
        }
    }

    pub fn block_count(&self) -> usize {
        self.table.index.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn load_block(&mut self, idx: usize) -> Result<()> {
        self.block_idx = idx;
        self.cursor = if idx < self.table.index.len() {
            Some(BlockCursor::new(self.table.read_block(idx)?))
        } else {
            None
        };
        Ok(())
    }

    /// Moves forward over exhausted blocks until an entry or the end of file.
    fn skip_exhausted_blocks(&mut self) -> Result<()> {
        while matches!(&self.cursor, Some(c) if c.current().is_none()) {
            self.load_block(self.block_idx + 1)?;
            if let Some(cursor) = &mut self.cursor {
                cursor.seek_to_first()?;
            }
        }
        Ok(())
    }
}

impl SortedKvIterator for TableReader {
    fn seek(&mut self, range: &Range) -> Result<()> {
        use std::ops::Bound;

        self.check_open()?;
        self.range = range.clone();

        let (target, exclusive) = match &range.start {
            Bound::Included(key) => (Some(key), false),
            Bound::Excluded(key) => (Some(key), true),
            Bound::Unbounded => (None, false),
        };

        match target {
            None => {
                self.load_block(0)?;
                if let Some(cursor) = &mut self.cursor {
                    cursor.seek_to_first()?;
                }
            }
            Some(target) => {
                let idx = self.table.index.find(target).unwrap_or(self.table.index.len());
                self.load_block(idx)?;
                if let Some(cursor) = &mut self.cursor {
                    cursor.seek(target)?;
                }
            }
        }
        self.skip_exhausted_blocks()?;

        if let Some(target) = target.filter(|_| exclusive) {
            if matches!(self.top(), Some((key, _)) if key == target) {
                self.next()?;
            }
        }
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.check_open()?;
        if let Some(cursor) = &mut self.cursor {
            cursor.advance()?;
        }
        self.skip_exhausted_blocks()
    }

    fn top(&self) -> Option<(&Key, &[u8])> {
        if self.is_closed() {
            return None;
        }
        let (key, value) = self.cursor.as_ref()?.current()?;
        if self.range.after_end(key) {
            return None;
        }
        Some((key, value.as_slice()))
    }

    fn deep_copy(&mut self) -> Result<BoxedIterator> {
        self.check_open()?;
        let copy = TableReader::unpositioned(self.table.clone(), self.copies.clone());
        self.copies.lock().unwrap().push(copy.closed.clone());
        Ok(Box::new(copy))
    }
}

impl FileReader for TableReader {
    fn close_deep_copies(&mut self) -> Result<()> {
        for closed in self.copies.lock().unwrap().drain(..) {
            closed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.close_deep_copies()?;
        self.closed.store(true, Ordering::SeqCst);
        self.cursor = None;
        self.table.file.lock().unwrap().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::drain;
    use std::ops::Bound;
    use tempfile::TempDir;

    fn entries(n: usize) -> Vec<(Key, Vec<u8>)> {
        (0..n)
            .map(|i| {
                (
                    Key::new(format!("key_{:04}", i), 1),
                    format!("value_{:04}", i).into_bytes(),
                )
            })
            .collect()
    }

    fn write_table(dir: &TempDir, name: &str, entries: &[(Key, Vec<u8>)]) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut writer = TableWriter::create(&path).unwrap().block_size(256);
        for (key, value) in entries {
            writer.add(key.clone(), value).unwrap();
        }
        let info = writer.finish().unwrap();
        assert_eq!(info.entries, entries.len() as u64);
        path
    }

    #[test]
    fn test_write_and_scan_all() {
        let dir = TempDir::new().unwrap();
        let expected = entries(200);
        let path = write_table(&dir, "all.sst", &expected);

        let mut reader = TableReader::open(&path, None, None).unwrap();
        assert!(reader.block_count() > 1);
        assert!(!reader.has_top());

        reader.seek(&Range::all()).unwrap();
        assert_eq!(drain(&mut reader).unwrap(), expected);
    }

    #[test]
    fn test_seek_range() {
        let dir = TempDir::new().unwrap();
        let expected = entries(200);
        let path = write_table(&dir, "range.sst", &expected);
        let mut reader = TableReader::open(&path, None, None).unwrap();

        reader.seek(&Range::rows("key_0010", "key_0020")).unwrap();
        assert_eq!(drain(&mut reader).unwrap(), expected[10..=20].to_vec());

        // Excluded start skips the exact key.
        let range = Range::new(
            Bound::Excluded(Key::new("key_0150", 1)),
            Bound::Excluded(Key::new("key_0153", 1)),
        );
        reader.seek(&range).unwrap();
        assert_eq!(drain(&mut reader).unwrap(), expected[151..153].to_vec());

        reader.seek(&Range::rows("zzz", "zzzz")).unwrap();
        assert!(!reader.has_top());
    }

    #[test]
    fn test_unsorted_add_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = TableWriter::create(dir.path().join("bad.sst")).unwrap();
        writer.add(Key::new("b", 1), b"x").unwrap();
        assert!(matches!(
            writer.add(Key::new("a", 1), b"y"),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_deep_copies_are_independent_and_closeable() {
        let dir = TempDir::new().unwrap();
        let expected = entries(50);
        let path = write_table(&dir, "copies.sst", &expected);
        let mut reader = TableReader::open(&path, None, None).unwrap();

        let mut copy = reader.deep_copy().unwrap();
        reader.seek(&Range::all()).unwrap();
        copy.seek(&Range::rows("key_0040", "key_0049")).unwrap();

        reader.next().unwrap();
        assert_eq!(reader.top().unwrap().0, &expected[1].0);
        assert_eq!(copy.top().unwrap().0, &expected[40].0);

        reader.close_deep_copies().unwrap();
        assert!(matches!(copy.next(), Err(Error::Closed)));
        assert!(reader.has_top());

        reader.close().unwrap();
        assert!(matches!(reader.seek(&Range::all()), Err(Error::Closed)));
    }

    #[test]
    fn test_close_releases_file_with_live_copy() {
        let dir = TempDir::new().unwrap();
        let path = write_table(&dir, "release.sst", &entries(50));
        let mut reader = TableReader::open(&path, None, None).unwrap();
        #[cfg(target_os = "linux")]
        let fd = {
            use std::os::unix::io::AsRawFd;
            reader.table.file.lock().unwrap().as_ref().unwrap().as_raw_fd()
        };

        let mut copy = reader.deep_copy().unwrap();
        reader.close().unwrap();
        assert!(reader.table.file.lock().unwrap().is_none());

        // The descriptor no longer refers to the file, though the copy lives.
        #[cfg(target_os = "linux")]
        {
            let link = std::fs::read_link(format!("/proc/self/fd/{}", fd)).ok();
            assert_ne!(link, Some(path.canonicalize().unwrap()));
        }
        assert!(matches!(copy.seek(&Range::all()), Err(Error::Closed)));

        // Blocks not yet cached cannot be read through the shared state either.
        assert!(matches!(reader.table.read_block(0), Err(Error::Closed)));
    }

    #[test]
    fn test_block_caches_are_used() {
        let dir = TempDir::new().unwrap();
        let path = write_table(&dir, "cached.sst", &entries(100));
        let data_cache = Arc::new(BlockCache::new(64));
        let index_cache = Arc::new(BlockCache::new(8));

        for _ in 0..2 {
            let mut reader =
                TableReader::open(&path, Some(data_cache.clone()), Some(index_cache.clone()))
                    .unwrap();
            reader.seek(&Range::all()).unwrap();
            drain(&mut reader).unwrap();
        }

        let (index_hits, _) = index_cache.stats();
        let (data_hits, _) = data_cache.stats();
        assert_eq!(index_hits, 1);
        assert!(data_hits > 0);
        assert!(!data_cache.is_empty());
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.sst");
        std::fs::write(&path, b"short").unwrap();
        assert!(matches!(
            TableReader::open(&path, None, None),
            Err(Error::Corruption(_))
        ));
    }
}
