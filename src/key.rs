//! Keys, ranges and tablet identifiers shared by readers and sessions.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

/// Table id reserved for the system metadata table. Scans of this table never
/// tolerate partially opened or unreadable files.
pub const METADATA_TABLE_ID: &str = "!0";

/// A key in a sorted file: row bytes plus a version timestamp.
///
/// Keys order by row ascending, then by timestamp descending so the newest
/// version of a row is seen first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub row: Vec<u8>,
    pub timestamp: u64,
}

impl Key {
    pub fn new(row: impl Into<Vec<u8>>, timestamp: u64) -> Self {
        Self {
            row: row.into(),
            timestamp,
        }
    }

    /// The first possible key of `row`.
    pub fn row_start(row: impl Into<Vec<u8>>) -> Self {
        Self::new(row, u64::MAX)
    }

    /// The last possible key of `row`.
    pub fn row_end(row: impl Into<Vec<u8>>) -> Self {
        Self::new(row, 0)
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.row
            .cmp(&other.row)
            .then_with(|| other.timestamp.cmp(&self.timestamp))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A range of keys to scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Range {
    pub start: Bound<Key>,
    pub end: Bound<Key>,
}

impl Range {
    pub fn new(start: Bound<Key>, end: Bound<Key>) -> Self {
        Self { start, end }
    }

    pub fn all() -> Self {
        Self::new(Bound::Unbounded, Bound::Unbounded)
    }

    /// Every key whose row falls in `[start_row, end_row]`.
    pub fn rows(start_row: impl Into<Vec<u8>>, end_row: impl Into<Vec<u8>>) -> Self {
        Self::new(
            Bound::Included(Key::row_start(start_row)),
            Bound::Included(Key::row_end(end_row)),
        )
    }

    /// The remainder of this range strictly after `key`.
    pub fn after(&self, key: &Key) -> Self {
        Self::new(Bound::Excluded(key.clone()), self.end.clone())
    }

    /// Widens both bounds to whole rows.
    pub fn whole_rows(&self) -> Self {
        let start = match &self.start {
            Bound::Included(k) | Bound::Excluded(k) => Bound::Included(Key::row_start(k.row.clone())),
            Bound::Unbounded => Bound::Unbounded,
        };
        let end = match &self.end {
            Bound::Included(k) | Bound::Excluded(k) => Bound::Included(Key::row_end(k.row.clone())),
            Bound::Unbounded => Bound::Unbounded,
        };
        Self::new(start, end)
    }

    pub fn before_start(&self, key: &Key) -> bool {
        match &self.start {
            Bound::Included(start) => key < start,
            Bound::Excluded(start) => key <= start,
            Bound::Unbounded => false,
        }
    }

    pub fn after_end(&self, key: &Key) -> bool {
        match &self.end {
            Bound::Included(end) => key > end,
            Bound::Excluded(end) => key >= end,
            Bound::Unbounded => false,
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        !self.before_start(key) && !self.after_end(key)
    }
}

impl Default for Range {
    fn default() -> Self {
        Self::all()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableId(pub String);

impl TableId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a tablet: a table id plus the row range `(prev_end_row, end_row]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyExtent {
    pub table_id: TableId,
    pub end_row: Option<Vec<u8>>,
    pub prev_end_row: Option<Vec<u8>>,
}

impl KeyExtent {
    pub fn new(
        table_id: impl Into<String>,
        end_row: Option<Vec<u8>>,
        prev_end_row: Option<Vec<u8>>,
    ) -> Self {
        Self {
            table_id: TableId::new(table_id),
            end_row,
            prev_end_row,
        }
    }

    /// A tablet spanning the whole table.
    pub fn whole_table(table_id: impl Into<String>) -> Self {
        Self::new(table_id, None, None)
    }

    pub fn is_metadata(&self) -> bool {
        self.table_id.as_str() == METADATA_TABLE_ID
    }
}

impl fmt::Display for KeyExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let row = |r: &Option<Vec<u8>>| match r {
            Some(r) => String::from_utf8_lossy(r).into_owned(),
            None => "<".to_string(),
        };
        write!(
            f,
            "{};{};{}",
            self.table_id,
            row(&self.end_row),
            row(&self.prev_end_row)
        )
    }
}

/// Per-file metadata a tablet keeps for each of its data files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataFileValue {
    pub size: u64,
    pub num_entries: u64,
    /// When set, every key read from the file carries this timestamp.
    pub time: Option<u64>,
}

impl DataFileValue {
    pub fn new(size: u64, num_entries: u64) -> Self {
        Self {
            size,
            num_entries,
            time: None,
        }
    }

    pub fn with_time(mut self, time: u64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn is_time_set(&self) -> bool {
        self.time.is_some()
    }
}
