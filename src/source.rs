//! Detachable data sources.
//!
//! A [`FileDataSource`] sits between a scan and the file handle it reads so
//! the handle can be given back to the file manager and later replaced by a
//! freshly reserved one. Scans read through a [`SourceSwitchingIterator`],
//! which notices the swap and re-seeks just past the last entry it returned.
//!
//! Deep copies taken from a switching iterator become dependents of the data
//! source. The data source holds only weak references to them; a copy lives
//! as long as the consumer that took it. Detaching or reattaching redirects
//! the root iterator and every live dependent together.

use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};
use crate::iterator::{top_entry, BoxedIterator, SortedKvIterator, Value};
use crate::key::{Key, Range};

struct SlotState {
    source: Option<BoxedIterator>,
    /// False once the source has been swapped and the reading iterator has
    /// not yet re-positioned itself on the new one.
    current: bool,
}

type Slot = Mutex<SlotState>;
type Dependents = Arc<Mutex<Vec<Weak<Slot>>>>;

fn new_slot(source: BoxedIterator) -> Arc<Slot> {
    Arc::new(Mutex::new(SlotState {
        source: Some(source),
        current: true,
    }))
}

pub struct FileDataSource {
    file: String,
    root: Arc<Slot>,
    dependents: Dependents,
}

impl FileDataSource {
    pub fn new(file: impl Into<String>, source: BoxedIterator) -> Self {
        Self {
            file: file.into(),
            root: new_slot(source),
            dependents: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    /// An iterator reading through this data source.
    pub fn iterator(&self) -> SourceSwitchingIterator {
        SourceSwitchingIterator::new(self.root.clone(), self.dependents.clone())
    }

    pub fn is_attached(&self) -> bool {
        self.root.lock().unwrap().source.is_some()
    }

    /// Number of deep copies still alive.
    pub fn dependent_count(&self) -> usize {
        self.live_dependents().len()
    }

    /// Drops the current source of the root and every dependent.
    pub fn unset(&self) {
        {
            let mut root = self.root.lock().unwrap();
            root.source = None;
            root.current = false;
        }
        for slot in self.live_dependents() {
            let mut dep = slot.lock().unwrap();
            dep.source = None;
            dep.current = false;
        }
    }

    /// Installs `source` as the root's source and gives every dependent a
    /// fresh deep copy of it.
    pub fn set(&self, source: BoxedIterator) -> Result<()> {
        let dependents = self.live_dependents();

        let mut root = self.root.lock().unwrap();
        root.source = Some(source);
        root.current = false;

        for slot in dependents {
            let copy = match root.source.as_mut() {
                Some(source) => source.deep_copy()?,
                None => return Err(Error::Detached),
            };
            let mut dep = slot.lock().unwrap();
            dep.source = Some(copy);
            dep.current = false;
        }
        Ok(())
    }

    fn live_dependents(&self) -> Vec<Arc<Slot>> {
        let mut dependents = self.dependents.lock().unwrap();
        dependents.retain(|weak| weak.strong_count() > 0);
        dependents.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Reads a data source, surviving swaps of the source underneath it.
pub struct SourceSwitchingIterator {
    slot: Arc<Slot>,
    dependents: Dependents,
    range: Option<Range>,
    top: Option<(Key, Value)>,
}

impl SourceSwitchingIterator {
    fn new(slot: Arc<Slot>, dependents: Dependents) -> Self {
        Self {
            slot,
            dependents,
            range: None,
            top: None,
        }
    }
}

impl SortedKvIterator for SourceSwitchingIterator {
    fn seek(&mut self, range: &Range) -> Result<()> {
        let mut state = self.slot.lock().unwrap();
        state.current = true;
        let source = state.source.as_mut().ok_or(Error::Detached)?;

        source.seek(range)?;
        self.range = Some(range.clone());
        self.top = top_entry(&**source);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let mut state = self.slot.lock().unwrap();
        let switched = !state.current;
        state.current = true;
        let source = state.source.as_mut().ok_or(Error::Detached)?;

        if switched {
            // Continue on the new source just past the entry last returned.
            match (&self.top, &self.range) {
                (Some((key, _)), Some(range)) => source.seek(&range.after(key))?,
                // Exhausted before the swap: stay exhausted.
                (None, Some(_)) => return Ok(()),
                (_, None) => source.next()?,
            }
        } else {
            source.next()?;
        }

        self.top = top_entry(&**source);
        Ok(())
    }

    fn top(&self) -> Option<(&Key, &[u8])> {
        self.top.as_ref().map(|(k, v)| (k, v.as_slice()))
    }

    fn deep_copy(&mut self) -> Result<BoxedIterator> {
        let copy = {
            let mut state = self.slot.lock().unwrap();
            let source = state.source.as_mut().ok_or(Error::Detached)?;
            source.deep_copy()?
        };

        let slot = new_slot(copy);
        let mut dependents = self.dependents.lock().unwrap();
        dependents.retain(|weak| weak.strong_count() > 0);
        dependents.push(Arc::downgrade(&slot));
        drop(dependents);

        Ok(Box::new(SourceSwitchingIterator::new(
            slot,
            self.dependents.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iterator::{drain, FileReader};
    use crate::memory::MemoryReader;

    fn entries(n: usize) -> Vec<(Key, Value)> {
        (0..n)
            .map(|i| (Key::new(format!("row_{:02}", i), 1), vec![i as u8]))
            .collect()
    }

    #[test]
    fn test_reads_through_source() {
        let ds = FileDataSource::new("f1", Box::new(MemoryReader::new(entries(5))));
        let mut iter = ds.iterator();
        iter.seek(&Range::all()).unwrap();
        assert_eq!(drain(&mut iter).unwrap(), entries(5));
    }

    #[test]
    fn test_detached_iterator_keeps_top_but_cannot_move() {
        let ds = FileDataSource::new("f1", Box::new(MemoryReader::new(entries(5))));
        let mut iter = ds.iterator();
        iter.seek(&Range::all()).unwrap();
        iter.next().unwrap();

        ds.unset();
        assert!(!ds.is_attached());
        assert_eq!(iter.top().unwrap().0, &entries(5)[1].0);
        assert!(matches!(iter.next(), Err(Error::Detached)));
        assert!(matches!(iter.deep_copy(), Err(Error::Detached)));
    }

    #[test]
    fn test_switch_resumes_after_last_entry() {
        let ds = FileDataSource::new("f1", Box::new(MemoryReader::new(entries(6))));
        let mut iter = ds.iterator();
        iter.seek(&Range::all()).unwrap();
        iter.next().unwrap();
        iter.next().unwrap();

        ds.unset();
        ds.set(Box::new(MemoryReader::new(entries(6)))).unwrap();

        assert_eq!(iter.top().unwrap().0, &entries(6)[2].0);
        assert_eq!(drain(&mut iter).unwrap(), entries(6)[2..].to_vec());
    }

    #[test]
    fn test_dropped_copies_are_forgotten() {
        let ds = FileDataSource::new("f1", Box::new(MemoryReader::new(entries(3))));
        let mut iter = ds.iterator();
        let kept = iter.deep_copy().unwrap();

        for _ in 0..100 {
            let mut copy = iter.deep_copy().unwrap();
            copy.seek(&Range::all()).unwrap();
        }

        // Only the kept copy and the most recent dropped one are tracked.
        assert!(iter.dependents.lock().unwrap().len() <= 2);
        assert_eq!(ds.dependent_count(), 1);
        drop(kept);
        assert_eq!(ds.dependent_count(), 0);
    }

    #[test]
    fn test_dependents_are_redirected() {
        let mut first = MemoryReader::new(entries(6));
        let ds = FileDataSource::new("f1", first.deep_copy().unwrap());
        let mut iter = ds.iterator();

        let mut copy = iter.deep_copy().unwrap();
        copy.seek(&Range::rows("row_03", "row_05")).unwrap();
        assert_eq!(ds.dependent_count(), 1);

        // Closing the old reader's copies and detaching leaves the copy stale.
        first.close_deep_copies().unwrap();
        ds.unset();
        assert!(matches!(copy.next(), Err(Error::Detached)));

        ds.set(Box::new(MemoryReader::new(entries(6)))).unwrap();
        copy.next().unwrap();
        assert_eq!(copy.top().unwrap().0, &entries(6)[4].0);

        drop(copy);
        assert_eq!(ds.dependent_count(), 0);
    }
}
