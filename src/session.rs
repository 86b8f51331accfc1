//! Per-scan view of the file manager.
//!
//! A [`ScanSession`] reserves the files one tablet scan reads, hands out
//! iterators over them, and gives them back. Detachable sessions can release
//! their files mid-scan (so a paused scan does not pin open files) and
//! reattach later with the iterators resuming where they stopped.
//!
//! ```text
//! Empty --open_files--> Attached --detach--> Detached
//!                          ^                    |
//!                          +-----reattach-------+
//! Attached | Detached --release_open_files--> Closed
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::handle::FileHandle;
use crate::iterator::BoxedIterator;
use crate::key::{DataFileValue, KeyExtent};
use crate::manager::FileManager;
use crate::source::FileDataSource;
use crate::wrappers::{HandleIterator, ProblemReportingIterator, TimeSettingIterator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Empty,
    Attached,
    Detached,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Empty => write!(f, "empty"),
            SessionState::Attached => write!(f, "attached"),
            SessionState::Detached => write!(f, "detached"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Files reserved for one scan of one tablet.
///
/// Not internally synchronized: drive a session from one thread at a time.
pub struct ScanSession {
    manager: Arc<FileManager>,
    extent: KeyExtent,
    continue_on_failure: bool,
    reserved: Vec<FileHandle>,
    data_sources: Vec<FileDataSource>,
    state: SessionState,
}

impl ScanSession {
    pub(crate) fn new(manager: Arc<FileManager>, extent: KeyExtent) -> Self {
        let continue_on_failure = manager.config().continue_on_failure(&extent);
        Self {
            manager,
            extent,
            continue_on_failure,
            reserved: Vec::new(),
            data_sources: Vec::new(),
            state: SessionState::Empty,
        }
    }

    pub fn extent(&self) -> &KeyExtent {
        &self.extent
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn continue_on_failure(&self) -> bool {
        self.continue_on_failure
    }

    /// Number of handles this session currently holds. Zero while detached.
    pub fn num_open_files(&self) -> usize {
        self.reserved.len()
    }

    /// Reserves `files` and returns one iterator per file obtained.
    ///
    /// Iterators are unpositioned; seek before reading. Files that fail to
    /// open are skipped only when the table ignores file failures, so fewer
    /// iterators than files means some were skipped. With `detachable`, the
    /// iterators survive [`detach`](Self::detach) and
    /// [`reattach`](Self::reattach).
    pub fn open_files(
        &mut self,
        files: &BTreeMap<String, DataFileValue>,
        detachable: bool,
    ) -> Result<Vec<BoxedIterator>> {
        match self.state {
            SessionState::Empty | SessionState::Attached => {}
            state => {
                return Err(Error::ProtocolViolation(format!(
                    "cannot open files on a {} session",
                    state
                )))
            }
        }

        let max_open = self.manager.max_open();
        if self.reserved.len() + files.len() >= max_open {
            return Err(Error::AdmissionLimitExceeded {
                requested: files.len(),
                reserved: self.reserved.len(),
                max_open,
            });
        }

        let names: Vec<String> = files.keys().cloned().collect();
        let handles =
            self.manager
                .reserve_readers(&self.extent.table_id, &names, self.continue_on_failure)?;
        self.reserved.extend(handles.iter().cloned());
        self.state = SessionState::Attached;

        let mut iters = Vec::with_capacity(handles.len());
        for handle in handles {
            let file = self.manager.reserved_file_name(&handle).ok_or_else(|| {
                Error::InvalidState(format!("handle {} is not reserved", handle.id()))
            })?;
            let time = files.get(&file).and_then(|value| value.time);

            let mut iter: BoxedIterator = Box::new(HandleIterator::new(handle));
            if detachable {
                let source = FileDataSource::new(file.clone(), iter);
                iter = Box::new(source.iterator());
                self.data_sources.push(source);
            }

            iter = Box::new(ProblemReportingIterator::new(
                self.extent.table_id.clone(),
                file,
                self.continue_on_failure,
                self.manager.reporter().clone(),
                iter,
            ));

            if let Some(time) = time {
                iter = Box::new(TimeSettingIterator::new(iter, time));
            }
            iters.push(iter);
        }

        Ok(iters)
    }

    /// Gives every reserved handle back to the file manager while keeping
    /// detachable iterators alive. They fail with `Error::Detached` if
    /// advanced before [`reattach`](Self::reattach).
    pub fn detach(&mut self) -> Result<()> {
        if self.state != SessionState::Attached {
            return Err(Error::ProtocolViolation(format!(
                "cannot detach a {} session",
                self.state
            )));
        }

        for source in &self.data_sources {
            source.unset();
        }
        self.manager.release_readers(&self.reserved, false)?;
        self.reserved.clear();
        self.state = SessionState::Detached;
        Ok(())
    }

    /// Reserves the files of every detachable iterator again and switches the
    /// iterators, and deep copies taken from them, onto the new handles.
    ///
    /// Failures to open are never skipped here. On error the session stays
    /// detached and holds nothing.
    pub fn reattach(&mut self) -> Result<()> {
        if self.state != SessionState::Detached {
            return Err(Error::ProtocolViolation(format!(
                "cannot reattach a {} session",
                self.state
            )));
        }
        if !self.reserved.is_empty() {
            return Err(Error::ProtocolViolation(
                "reattaching a session that still holds files".to_string(),
            ));
        }

        let names: Vec<String> = self
            .data_sources
            .iter()
            .map(|source| source.file().to_string())
            .collect();
        let handles = self
            .manager
            .reserve_readers(&self.extent.table_id, &names, false)?;

        let mut by_file: HashMap<String, Vec<FileHandle>> = HashMap::new();
        for handle in &handles {
            let file = self.manager.reserved_file_name(handle).ok_or_else(|| {
                Error::InvalidState(format!("handle {} is not reserved", handle.id()))
            })?;
            by_file.entry(file).or_default().push(handle.clone());
        }

        self.reserved = handles;
        self.state = SessionState::Attached;

        for source in &self.data_sources {
            let handle = by_file
                .get_mut(source.file())
                .and_then(Vec::pop)
                .ok_or_else(|| {
                    Error::InvalidState(format!("no handle reserved for {}", source.file()))
                })?;
            source.set(Box::new(HandleIterator::new(handle)))?;
        }

        Ok(())
    }

    /// Ends the session, returning its handles to the file manager. With
    /// `saw_error` the handles are closed instead of cached.
    ///
    /// Calling this on a closed session does nothing.
    pub fn release_open_files(&mut self, saw_error: bool) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        for source in &self.data_sources {
            source.unset();
        }
        self.data_sources.clear();
        self.state = SessionState::Closed;

        let handles = std::mem::take(&mut self.reserved);
        self.manager.release_readers(&handles, saw_error)
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        // The scan did not finish cleanly; do not hand its files to others.
        if let Err(e) = self.release_open_files(true) {
            tracing::error!(extent = %self.extent, error = %e, "Failed to release files of dropped session");
        }
    }
}
