//! Bounded pool of open sorted-file readers for tablet scans.
//!
//! A [`FileManager`] caps how many files a server holds open at once, caches
//! released readers for reuse, and closes readers that sit idle. Scans reserve
//! files through a [`ScanSession`], which can detach from its files mid-scan
//! and reattach later without losing its place.

pub mod cache;
pub mod config;
pub mod error;
pub mod gate;
pub mod handle;
pub mod iterator;
pub mod key;
pub mod manager;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod opener;
pub mod pool;
pub mod problems;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod sstable;
pub mod tasks;
pub mod wrappers;

pub use cache::BlockCache;
pub use config::{FileManagerConfig, TableConfig};
pub use error::{Error, Result};
pub use handle::FileHandle;
pub use iterator::{BoxedIterator, FileReader, SortedKvIterator};
pub use key::{DataFileValue, Key, KeyExtent, Range, TableId};
pub use manager::{FileManager, FileManagerStats};
pub use opener::{FileOpener, SstableOpener};
pub use problems::{ProblemReport, ProblemReporter, ProblemReports};
pub use scheduler::Scheduler;
pub use session::{ScanSession, SessionState};
