//! Seekable sorted key-value iterators.
//!
//! Every layer a scan sees (raw file readers, the detachable indirection, the
//! problem-reporting and time-setting wrappers) implements [`SortedKvIterator`].
//! Readers produced by the storage layer additionally implement [`FileReader`]
//! so the file manager can close them and the deep copies they spawned.

use crate::error::Result;
use crate::key::{Key, Range};

pub type Value = Vec<u8>;

/// Type alias for the iterators handed to scans.
pub type BoxedIterator = Box<dyn SortedKvIterator>;

pub trait SortedKvIterator: Send {
    /// Positions the iterator at the first key inside `range`.
    fn seek(&mut self, range: &Range) -> Result<()>;

    /// Advances past the current top entry.
    fn next(&mut self) -> Result<()>;

    /// The entry the iterator is positioned at, if any.
    fn top(&self) -> Option<(&Key, &[u8])>;

    fn has_top(&self) -> bool {
        self.top().is_some()
    }

    /// Returns an independent, unpositioned cursor over the same data.
    fn deep_copy(&mut self) -> Result<BoxedIterator>;
}

/// An open handle on one immutable sorted file.
pub trait FileReader: SortedKvIterator {
    /// Closes every deep copy spawned from this reader. Later use of those
    /// copies fails with `Error::Closed`.
    fn close_deep_copies(&mut self) -> Result<()>;

    /// Releases the underlying file. The reader must not be used afterwards.
    fn close(&mut self) -> Result<()>;
}

impl<T: SortedKvIterator + ?Sized> SortedKvIterator for Box<T> {
    fn seek(&mut self, range: &Range) -> Result<()> {
        (**self).seek(range)
    }

    fn next(&mut self) -> Result<()> {
        (**self).next()
    }

    fn top(&self) -> Option<(&Key, &[u8])> {
        (**self).top()
    }

    fn deep_copy(&mut self) -> Result<BoxedIterator> {
        (**self).deep_copy()
    }
}

/// Reads everything left in `iter` (which must already be seeked).
pub fn drain<I: SortedKvIterator + ?Sized>(iter: &mut I) -> Result<Vec<(Key, Value)>> {
    let mut entries = Vec::new();
    while let Some((key, value)) = iter.top() {
        entries.push((key.clone(), value.to_vec()));
        iter.next()?;
    }
    Ok(entries)
}

/// Returns the top entry as owned data.
pub fn top_entry<I: SortedKvIterator + ?Sized>(iter: &I) -> Option<(Key, Value)> {
    iter.top().map(|(k, v)| (k.clone(), v.to_vec()))
}

impl std::fmt::Debug for dyn SortedKvIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedKvIterator").finish_non_exhaustive()
    }
}
