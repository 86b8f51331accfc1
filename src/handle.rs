use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::Result;
use crate::iterator::FileReader;

pub type HandleId = u64;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// An open reader on one file, shared between the session that reserved it and
/// the iterators built on top of it.
///
/// At any moment a handle is either reserved by a session, idle in the file
/// manager's cache, or closed. Clones refer to the same reader.
#[derive(Clone)]
pub struct FileHandle {
    id: HandleId,
    reader: Arc<Mutex<Box<dyn FileReader>>>,
}

impl FileHandle {
    pub fn new(reader: Box<dyn FileReader>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::SeqCst),
            reader: Arc::new(Mutex::new(reader)),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<dyn FileReader>> {
        self.reader.lock().unwrap()
    }

    pub fn close_deep_copies(&self) -> Result<()> {
        self.lock().close_deep_copies()
    }

    pub fn close(&self) -> Result<()> {
        self.lock().close()
    }
}

impl PartialEq for FileHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FileHandle {}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle").field("id", &self.id).finish()
    }
}
