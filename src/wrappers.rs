//! Layers placed between an open file handle and the scan reading it.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::handle::FileHandle;
use crate::iterator::{top_entry, BoxedIterator, SortedKvIterator, Value};
use crate::key::{Key, Range, TableId};
use crate::problems::{ProblemKind, ProblemReport, ProblemReporter};

/// Iterates a reserved file handle.
///
/// The handle is shared with the session that reserved it, so the current
/// entry is copied out after every move.
pub struct HandleIterator {
    handle: FileHandle,
    top: Option<(Key, Value)>,
}

impl HandleIterator {
    pub fn new(handle: FileHandle) -> Self {
        Self { handle, top: None }
    }

    fn refresh<R: SortedKvIterator + ?Sized>(&mut self, reader: &R) {
        self.top = top_entry(reader);
    }
}

impl SortedKvIterator for HandleIterator {
    fn seek(&mut self, range: &Range) -> Result<()> {
        let handle = self.handle.clone();
        let mut reader = handle.lock();
        reader.seek(range)?;
        self.refresh(&**reader);
        Ok(())
    }

    fn next(&mut self) -> Result<()> {
        let handle = self.handle.clone();
        let mut reader = handle.lock();
        reader.next()?;
        self.refresh(&**reader);
        Ok(())
    }

    fn top(&self) -> Option<(&Key, &[u8])> {
        self.top.as_ref().map(|(k, v)| (k, v.as_slice()))
    }

    fn deep_copy(&mut self) -> Result<BoxedIterator> {
        self.handle.lock().deep_copy()
    }
}

/// Reports read failures of one file.
///
/// With `continue_on_failure` a failing file is reported once and then looks
/// exhausted; otherwise the failure is reported and returned as
/// `Error::ReadFailure`.
pub struct ProblemReportingIterator {
    table_id: TableId,
    file: String,
    continue_on_failure: bool,
    reporter: Arc<dyn ProblemReporter>,
    inner: BoxedIterator,
    saw_error: bool,
}

impl ProblemReportingIterator {
    pub fn new(
        table_id: TableId,
        file: impl Into<String>,
        continue_on_failure: bool,
        reporter: Arc<dyn ProblemReporter>,
        inner: BoxedIterator,
    ) -> Self {
        Self {
            table_id,
            file: file.into(),
            continue_on_failure,
            reporter,
            inner,
            saw_error: false,
        }
    }

    pub fn saw_error(&self) -> bool {
        self.saw_error
    }

    fn handle(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            // Lifecycle errors are not problems with the file.
            Err(e @ (Error::Detached | Error::Closed)) => Err(e),
            Err(e) => {
                self.reporter.report(ProblemReport::new(
                    self.table_id.clone(),
                    ProblemKind::FileRead,
                    self.file.clone(),
                    &e,
                ));
                if self.continue_on_failure {
                    tracing::warn!(file = %self.file, error = %e, "Read failed, skipping rest of file");
                    self.saw_error = true;
                    Ok(())
                } else {
                    Err(Error::ReadFailure {
                        file: self.file.clone(),
                        source: Box::new(e),
                    })
                }
            }
        }
    }
}

impl SortedKvIterator for ProblemReportingIterator {
    fn seek(&mut self, range: &Range) -> Result<()> {
        if self.saw_error {
            return Ok(());
        }
        let result = self.inner.seek(range);
        self.handle(result)
    }

    fn next(&mut self) -> Result<()> {
        if self.saw_error {
            return Ok(());
        }
        let result = self.inner.next();
        self.handle(result)
    }

    fn top(&self) -> Option<(&Key, &[u8])> {
        if self.saw_error {
            return None;
        }
        self.inner.top()
    }

    fn deep_copy(&mut self) -> Result<BoxedIterator> {
        Ok(Box::new(ProblemReportingIterator::new(
            self.table_id.clone(),
            self.file.clone(),
            self.continue_on_failure,
            self.reporter.clone(),
            self.inner.deep_copy()?,
        )))
    }
}

/// Gives every key read from a file the file's fixed timestamp.
pub struct TimeSettingIterator {
    inner: BoxedIterator,
    time: u64,
    range: Range,
    top_key: Option<Key>,
}

impl TimeSettingIterator {
    pub fn new(inner: BoxedIterator, time: u64) -> Self {
        Self {
            inner,
            time,
            range: Range::all(),
            top_key: None,
        }
    }

    /// Skips source entries whose rewritten key falls before the range.
    fn find_top(&mut self) -> Result<()> {
        self.top_key = None;
        while let Some((key, _)) = self.inner.top() {
            let key = Key::new(key.row.clone(), self.time);
            if self.range.before_start(&key) {
                self.inner.next()?;
                continue;
            }
            if !self.range.after_end(&key) {
                self.top_key = Some(key);
            }
            break;
        }
        Ok(())
    }
}

impl SortedKvIterator for TimeSettingIterator {
    fn seek(&mut self, range: &Range) -> Result<()> {
        self.range = range.clone();
        // Source timestamps differ from the ones returned, so whole rows are read.
        self.inner.seek(&range.whole_rows())?;
        self.find_top()
    }

    fn next(&mut self) -> Result<()> {
        self.inner.next()?;
        self.find_top()
    }

    fn top(&self) -> Option<(&Key, &[u8])> {
        let key = self.top_key.as_ref()?;
        let (_, value) = self.inner.top()?;
        Some((key, value))
    }

    fn deep_copy(&mut self) -> Result<BoxedIterator> {
        Ok(Box::new(TimeSettingIterator::new(
            self.inner.deep_copy()?,
            self.time,
        )))
    }
}
