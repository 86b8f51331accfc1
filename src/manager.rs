//! The file manager: a bounded pool of open file handles shared by every scan
//! on a server.
//!
//! Handles are in exactly one of three places: reserved by a scan, idle in the
//! cache, or in flight (being opened for a reservation or being handed back).
//! The sum of all three never exceeds `max_open`:
//!
//! - the admission gate bounds reserved plus in-flight handles;
//! - before a reservation opens anything it evicts enough idle handles that
//!   idle plus reserved plus in-flight fits.
//!
//! Bookkeeping happens under one mutex. Opening and closing files never does.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::cache::BlockCache;
use crate::config::FileManagerConfig;
use crate::error::{Error, Result};
use crate::gate::AdmissionGate;
use crate::handle::FileHandle;
use crate::key::{KeyExtent, TableId};
use crate::opener::FileOpener;
use crate::pool::{HandleCache, ReservationRegistry};
use crate::problems::{ProblemKind, ProblemReport, ProblemReporter};
use crate::session::ScanSession;

#[derive(Default)]
struct PoolState {
    cache: HandleCache,
    reserved: ReservationRegistry,
    /// Handles counted against `max_open` that are neither cached nor
    /// registered: reservations still opening, releases still closing deep
    /// copies.
    in_flight: usize,
}

impl PoolState {
    fn open_count(&self) -> usize {
        self.cache.len() + self.reserved.len() + self.in_flight
    }
}

#[derive(Default)]
struct Counters {
    opens: AtomicU64,
    reuses: AtomicU64,
    evictions: AtomicU64,
    idle_closes: AtomicU64,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileManagerStats {
    pub max_open: usize,
    pub reserved: usize,
    pub cached: usize,
    pub in_flight: usize,
    pub available_permits: usize,
    /// Files opened through the storage layer.
    pub opens: u64,
    /// Reservations satisfied from the cache.
    pub reuses: u64,
    /// Cached handles closed to make room.
    pub evictions: u64,
    /// Cached handles closed for sitting idle.
    pub idle_closes: u64,
}

impl FileManagerStats {
    /// Handles currently open, whoever holds them.
    pub fn open_files(&self) -> usize {
        self.reserved + self.cached + self.in_flight
    }
}

pub struct FileManager {
    config: FileManagerConfig,
    opener: Arc<dyn FileOpener>,
    reporter: Arc<dyn ProblemReporter>,
    data_cache: Option<Arc<BlockCache>>,
    index_cache: Option<Arc<BlockCache>>,
    gate: AdmissionGate,
    state: Mutex<PoolState>,
    counters: Counters,
}

impl FileManager {
    pub fn new(
        config: FileManagerConfig,
        opener: Arc<dyn FileOpener>,
        reporter: Arc<dyn ProblemReporter>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            gate: AdmissionGate::new(config.max_open),
            config,
            opener,
            reporter,
            data_cache: None,
            index_cache: None,
            state: Mutex::new(PoolState::default()),
            counters: Counters::default(),
        })
    }

    /// Block caches handed to the storage layer on every open.
    pub fn block_caches(
        mut self,
        data_cache: Option<Arc<BlockCache>>,
        index_cache: Option<Arc<BlockCache>>,
    ) -> Self {
        self.data_cache = data_cache;
        self.index_cache = index_cache;
        self
    }

    pub fn config(&self) -> &FileManagerConfig {
        &self.config
    }

    pub fn max_open(&self) -> usize {
        self.config.max_open
    }

    pub(crate) fn reporter(&self) -> &Arc<dyn ProblemReporter> {
        &self.reporter
    }

    pub fn new_scan_session(self: &Arc<Self>, extent: KeyExtent) -> ScanSession {
        ScanSession::new(self.clone(), extent)
    }

    /// Reserves one open handle for each of `files`, reusing cached handles
    /// where possible and opening the rest.
    ///
    /// Blocks until enough capacity is free. When a file fails to open and
    /// `continue_on_failure` is set, the file is reported and skipped, so the
    /// result can be shorter than `files`. Otherwise every handle obtained by
    /// this call is closed, all capacity it took is given back, and the call
    /// fails with `Error::FileOpenFailure`.
    pub fn reserve_readers(
        &self,
        table_id: &TableId,
        files: &[String],
        continue_on_failure: bool,
    ) -> Result<Vec<FileHandle>> {
        if files.len() >= self.config.max_open {
            return Err(Error::AdmissionLimitExceeded {
                requested: files.len(),
                reserved: 0,
                max_open: self.config.max_open,
            });
        }
        if files.is_empty() {
            return Ok(Vec::new());
        }

        self.gate.acquire(files.len());

        let (reused, to_open, evicted) = {
            let mut state = self.state.lock().unwrap();
            let (reused, to_open) = state.cache.take_cached(files);
            state.in_flight += files.len();

            let overflow = state.open_count().saturating_sub(self.config.max_open);
            let evicted = state.cache.evict_oldest(overflow);
            (reused, to_open, evicted)
        };

        self.counters
            .reuses
            .fetch_add(reused.len() as u64, Ordering::Relaxed);
        if !evicted.is_empty() {
            tracing::debug!(count = evicted.len(), "Evicting cached files to make room");
            self.counters
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            close_all(evicted);
        }

        let table_config = self.config.table_config(table_id);
        let mut obtained: Vec<(String, FileHandle)> = reused;
        let mut skipped = 0;

        for file in to_open {
            self.counters.opens.fetch_add(1, Ordering::Relaxed);
            let reader = self.opener.open(
                &file,
                table_config,
                self.data_cache.as_ref(),
                self.index_cache.as_ref(),
            );

            match reader {
                Ok(reader) => obtained.push((file, FileHandle::new(reader))),
                Err(e) => {
                    self.reporter.report(ProblemReport::new(
                        table_id.clone(),
                        ProblemKind::FileRead,
                        file.clone(),
                        &e,
                    ));

                    if continue_on_failure {
                        tracing::warn!(table = %table_id, file = %file, error = %e, "Failed to open file, skipping");
                        skipped += 1;
                        self.state.lock().unwrap().in_flight -= 1;
                        self.gate.release(1);
                        continue;
                    }

                    tracing::error!(table = %table_id, file = %file, error = %e, "Failed to open file");
                    let held = files.len() - skipped;
                    close_all(obtained.into_iter().map(|(_, handle)| handle).collect());
                    self.state.lock().unwrap().in_flight -= held;
                    self.gate.release(held);

                    return Err(Error::FileOpenFailure {
                        file,
                        source: Box::new(e),
                    });
                }
            }
        }

        let mut state = self.state.lock().unwrap();
        state.in_flight -= obtained.len();
        Ok(obtained
            .into_iter()
            .map(|(file, handle)| {
                state.reserved.insert(&handle, file);
                handle
            })
            .collect())
    }

    /// Gives reserved handles back to the pool.
    ///
    /// Every handle must currently be reserved; otherwise nothing changes and
    /// `Error::ProtocolViolation` is returned. Deep copies spawned from each
    /// handle are closed. Unless `saw_error` is set, or closing deep copies
    /// fails, the handles are cached for reuse; otherwise they are closed.
    pub fn release_readers(&self, handles: &[FileHandle], saw_error: bool) -> Result<()> {
        if handles.is_empty() {
            return Ok(());
        }

        let files = {
            let mut state = self.state.lock().unwrap();
            let distinct: HashSet<_> = handles.iter().map(FileHandle::id).collect();
            if distinct.len() != handles.len() || !state.reserved.contains_all(handles) {
                return Err(Error::ProtocolViolation(
                    "releasing files that are not reserved".to_string(),
                ));
            }

            let files: Vec<String> = handles
                .iter()
                .filter_map(|handle| state.reserved.remove(handle))
                .collect();
            state.in_flight += handles.len();
            files
        };

        let mut saw_error = saw_error;
        for (handle, file) in handles.iter().zip(&files) {
            if let Err(e) = handle.close_deep_copies() {
                tracing::warn!(file = %file, error = %e, "Failed to close deep copies");
                saw_error = true;
            }
        }

        if saw_error {
            close_all(handles.to_vec());
            self.state.lock().unwrap().in_flight -= handles.len();
        } else {
            let now = Instant::now();
            let mut state = self.state.lock().unwrap();
            state.in_flight -= handles.len();
            for (handle, file) in handles.iter().zip(files) {
                state.cache.insert(file, handle.clone(), now);
            }
        }

        self.gate.release(handles.len());
        Ok(())
    }

    /// The file a reserved handle reads, or `None` if it is not reserved.
    pub fn reserved_file_name(&self, handle: &FileHandle) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.reserved.file_name(handle).map(str::to_string)
    }

    /// Closes cached handles released more than `max_idle` ago.
    pub fn close_idle_readers(&self) -> usize {
        self.close_readers_idle_at(Instant::now())
    }

    /// Like [`close_idle_readers`](Self::close_idle_readers), measuring idle
    /// time up to `now`.
    pub fn close_readers_idle_at(&self, now: Instant) -> usize {
        let idle = {
            let mut state = self.state.lock().unwrap();
            state.cache.take_idle(now, self.config.max_idle)
        };

        let count = idle.len();
        if count > 0 {
            tracing::debug!(count, "Closing idle files");
            self.counters
                .idle_closes
                .fetch_add(count as u64, Ordering::Relaxed);
            close_all(idle);
        }
        count
    }

    pub fn stats(&self) -> FileManagerStats {
        let (reserved, cached, in_flight) = {
            let state = self.state.lock().unwrap();
            (state.reserved.len(), state.cache.len(), state.in_flight)
        };

        FileManagerStats {
            max_open: self.config.max_open,
            reserved,
            cached,
            in_flight,
            available_permits: self.gate.available(),
            opens: self.counters.opens.load(Ordering::Relaxed),
            reuses: self.counters.reuses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            idle_closes: self.counters.idle_closes.load(Ordering::Relaxed),
        }
    }

    /// Logs a snapshot of the pool.
    pub fn collect_metrics(&self) -> FileManagerStats {
        let stats = self.stats();
        tracing::info!(
            max_open = stats.max_open,
            reserved = stats.reserved,
            cached = stats.cached,
            in_flight = stats.in_flight,
            available_permits = stats.available_permits,
            opens = stats.opens,
            reuses = stats.reuses,
            evictions = stats.evictions,
            idle_closes = stats.idle_closes,
            "File manager metrics"
        );
        stats
    }
}

impl Drop for FileManager {
    fn drop(&mut self) {
        let cached = match self.state.get_mut() {
            Ok(state) => state.cache.drain(),
            Err(poisoned) => poisoned.into_inner().cache.drain(),
        };
        close_all(cached);
    }
}

fn close_all(handles: Vec<FileHandle>) {
    for handle in handles {
        if let Err(e) = handle.close() {
            tracing::error!(handle = handle.id(), error = %e, "Failed to close file");
        }
    }
}
