//! The storage layer: turns file names into open readers.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::BlockCache;
use crate::config::TableConfig;
use crate::error::Result;
use crate::iterator::FileReader;
use crate::sstable::TableReader;

pub trait FileOpener: Send + Sync {
    /// Opens `file` for reading. Readers must tolerate absent caches.
    fn open(
        &self,
        file: &str,
        table_config: &TableConfig,
        data_cache: Option<&Arc<BlockCache>>,
        index_cache: Option<&Arc<BlockCache>>,
    ) -> Result<Box<dyn FileReader>>;
}

/// Opens sorted files written by [`crate::sstable::TableWriter`], resolving
/// relative names against a base directory.
pub struct SstableOpener {
    base_dir: PathBuf,
}

impl SstableOpener {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

impl FileOpener for SstableOpener {
    fn open(
        &self,
        file: &str,
        _table_config: &TableConfig,
        data_cache: Option<&Arc<BlockCache>>,
        index_cache: Option<&Arc<BlockCache>>,
    ) -> Result<Box<dyn FileReader>> {
        let reader = TableReader::open(
            self.base_dir.join(file),
            data_cache.cloned(),
            index_cache.cloned(),
        )?;
        Ok(Box::new(reader))
    }
}
