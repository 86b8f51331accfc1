//! In-memory sorted files and a storage layer serving them.
//!
//! `MemoryOpener` stands in for the filesystem: it counts opens and closes and
//! can be told to fail opening or reading particular files.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::BlockCache;
use crate::config::TableConfig;
use crate::error::{Error, Result};
use crate::iterator::{BoxedIterator, FileReader, SortedKvIterator, Value};
use crate::key::{Key, Range};
use crate::opener::FileOpener;

type Entries = Arc<Vec<(Key, Value)>>;

/// A reader over a sorted, immutable list of entries.
pub struct MemoryReader {
    entries: Entries,
    pos: usize,
    range: Range,
    closed: Arc<AtomicBool>,
    /// Close flags of every deep copy spawned from the root reader.
    copies: Arc<Mutex<Vec<Arc<AtomicBool>>>>,
    fail_reads: bool,
    closes: Option<Arc<AtomicUsize>>,
}

impl MemoryReader {
    /// `entries` must be sorted by key.
    pub fn new(entries: Vec<(Key, Value)>) -> Self {
        Self::shared(Arc::new(entries))
    }

    fn shared(entries: Entries) -> Self {
        let pos = entries.len();
        Self {
            entries,
            pos,
            range: Range::all(),
            closed: Arc::new(AtomicBool::new(false)),
            copies: Arc::new(Mutex::new(Vec::new())),
            fail_reads: false,
            closes: None,
        }
    }

    /// Makes every `next` fail, as a corrupt file would.
    pub fn failing_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    fn with_close_counter(mut self, closes: Arc<AtomicUsize>) -> Self {
        self.closes = Some(closes);
        self
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
}

impl SortedKvIterator for MemoryReader {
    fn seek(&mut self, range: &Range) -> Result<()> {
        self.check_open()?;
        self.range = range.clone();
        self.pos = self.entries.partition_point(|(k, _)| range.before_start(k));
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        self.check_open()?;
        if self.fail_reads {
            return Err(Error::IoError(io::Error::other("injected read failure")));
        }
        if self.pos < self.entries.len() {
            self.pos += 1;
        }
        Ok(())
    }

    fn top(&self) -> Option<(&Key, &[u8])> {
        if self.is_closed() {
            return None;
        }
        let (key, value) = self.entries.get(self.pos)?;
        if self.range.after_end(key) {
            return None;
        }
        Some((key, value.as_slice()))
    }

    fn deep_copy(&mut self) -> Result<BoxedIterator> {
        self.check_open()?;
        let mut copy = MemoryReader::shared(self.entries.clone());
        copy.copies = self.copies.clone();
        copy.fail_reads = self.fail_reads;
        self.copies.lock().unwrap().push(copy.closed.clone());
        Ok(Box::new(copy))
    }
}

impl FileReader for MemoryReader {
    fn close_deep_copies(&mut self) -> Result<()> {
        for closed in self.copies.lock().unwrap().drain(..) {
            closed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.close_deep_copies()?;
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(closes) = &self.closes {
                closes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

/// Storage layer over in-memory files.
#[derive(Default)]
pub struct MemoryOpener {
    files: Mutex<HashMap<String, Entries>>,
    failing_opens: Mutex<HashSet<String>>,
    failing_reads: Mutex<HashSet<String>>,
    opens: Mutex<HashMap<String, usize>>,
    total_opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a file; `entries` are sorted before being stored.
    pub fn add_file(&self, name: impl Into<String>, mut entries: Vec<(Key, Value)>) {
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        self.files
            .lock()
            .unwrap()
            .insert(name.into(), Arc::new(entries));
    }

    pub fn fail_open(&self, name: impl Into<String>) {
        self.failing_opens.lock().unwrap().insert(name.into());
    }

    pub fn fail_reads(&self, name: impl Into<String>) {
        self.failing_reads.lock().unwrap().insert(name.into());
    }

    /// Number of `open` calls, successful or not.
    pub fn open_count(&self) -> usize {
        self.total_opens.load(Ordering::SeqCst)
    }

    pub fn open_count_of(&self, name: &str) -> usize {
        self.opens.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    /// Number of readers this opener produced that have since been closed.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl FileOpener for MemoryOpener {
    fn open(
        &self,
        file: &str,
        _table_config: &TableConfig,
        _data_cache: Option<&Arc<BlockCache>>,
        _index_cache: Option<&Arc<BlockCache>>,
    ) -> Result<Box<dyn FileReader>> {
        self.total_opens.fetch_add(1, Ordering::SeqCst);
        *self.opens.lock().unwrap().entry(file.to_string()).or_default() += 1;

        if self.failing_opens.lock().unwrap().contains(file) {
            return Err(Error::IoError(io::Error::other(format!(
                "injected open failure for {}",
                file
            ))));
        }

        let entries = self.files.lock().unwrap().get(file).cloned().ok_or_else(|| {
            Error::IoError(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such file {}", file),
            ))
        })?;

        let mut reader = MemoryReader::shared(entries).with_close_counter(self.closes.clone());
        if self.failing_reads.lock().unwrap().contains(file) {
            reader = reader.failing_reads();
        }
        Ok(Box::new(reader))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::drain;

    fn entries(rows: &[&str]) -> Vec<(Key, Value)> {
        rows.iter()
            .map(|r| (Key::new(*r, 1), r.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_seek_and_drain() {
        let mut reader = MemoryReader::new(entries(&["a", "b", "c", "d"]));
        assert!(!reader.has_top());

        reader.seek(&Range::rows("b", "c")).unwrap();
        let rows: Vec<_> = drain(&mut reader)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k.row)
            .collect();
        assert_eq!(rows, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn test_close_deep_copies() {
        let mut reader = MemoryReader::new(entries(&["a", "b"]));
        let mut copy = reader.deep_copy().unwrap();
        let mut copy_of_copy = copy.deep_copy().unwrap();
        copy.seek(&Range::all()).unwrap();
        assert!(copy.has_top());

        reader.close_deep_copies().unwrap();
        assert!(!copy.has_top());
        assert!(matches!(copy.next(), Err(Error::Closed)));
        assert!(matches!(copy_of_copy.seek(&Range::all()), Err(Error::Closed)));

        // The root reader is still usable.
        reader.seek(&Range::all()).unwrap();
        assert!(reader.has_top());
    }

    #[test]
    fn test_opener_counts_and_failures() {
        let opener = MemoryOpener::new();
        opener.add_file("f1", entries(&["a"]));
        opener.add_file("f2", entries(&["b"]));
        opener.fail_open("f2");

        let config = TableConfig::default();
        let mut reader = opener.open("f1", &config, None, None).unwrap();
        assert!(opener.open("f2", &config, None, None).is_err());
        assert!(opener.open("missing", &config, None, None).is_err());

        assert_eq!(opener.open_count(), 3);
        assert_eq!(opener.open_count_of("f1"), 1);

        reader.close().unwrap();
        reader.close().unwrap();
        assert_eq!(opener.close_count(), 1);
    }
}
