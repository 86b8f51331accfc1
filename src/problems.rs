//! Problem reports: operator-visible records of files that could not be read.

use std::fmt;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::key::TableId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProblemKind {
    /// A file could not be opened or read.
    FileRead,
}

impl fmt::Display for ProblemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProblemKind::FileRead => f.write_str("FILE_READ"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemReport {
    pub table_id: TableId,
    pub kind: ProblemKind,
    pub file: String,
    pub message: String,
    pub reported_at: SystemTime,
}

impl ProblemReport {
    pub fn new(
        table_id: TableId,
        kind: ProblemKind,
        file: impl Into<String>,
        error: &dyn std::error::Error,
    ) -> Self {
        Self {
            table_id,
            kind,
            file: file.into(),
            message: error.to_string(),
            reported_at: SystemTime::now(),
        }
    }
}

/// Sink for problem reports.
pub trait ProblemReporter: Send + Sync {
    fn report(&self, report: ProblemReport);
}

/// Keeps reports in memory and logs each one.
#[derive(Default)]
pub struct ProblemReports {
    reports: Mutex<Vec<ProblemReport>>,
}

impl ProblemReports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ProblemReport> {
        self.reports.lock().unwrap().clone()
    }

    pub fn reports_for(&self, file: &str) -> Vec<ProblemReport> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.file == file)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProblemReporter for ProblemReports {
    fn report(&self, report: ProblemReport) {
        tracing::warn!(
            table = %report.table_id,
            kind = %report.kind,
            file = %report.file,
            error = %report.message,
            "Problem reported"
        );
        self.reports.lock().unwrap().push(report);
    }
}
