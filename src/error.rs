use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// A single request asked for at least `max_open` files.
    AdmissionLimitExceeded {
        requested: usize,
        reserved: usize,
        max_open: usize,
    },
    /// A file could not be opened and the reservation was aborted.
    FileOpenFailure {
        file: String,
        source: Box<Error>,
    },
    /// A file failed while it was being read by a scan.
    ReadFailure {
        file: String,
        source: Box<Error>,
    },
    ProtocolViolation(String),
    Detached,
    Closed,
    Decode(&'static str, io::Error),
    Corruption(String),
    ChecksumMismatch,
    InvalidConfig(String),
    InvalidState(String),
}

impl Error {
    pub fn is_admission_limit(&self) -> bool {
        matches!(self, Error::AdmissionLimitExceeded { .. })
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::ProtocolViolation(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::AdmissionLimitExceeded {
                requested,
                reserved,
                max_open,
            } => write!(
                f,
                "Request to open {} files would exceed max open files (reserved={}, max_open={})",
                requested, reserved, max_open
            ),
            Error::FileOpenFailure { file, source } => {
                write!(f, "Failed to open {}: {}", file, source)
            }
            Error::ReadFailure { file, source } => {
                write!(f, "Failed to read {}: {}", file, source)
            }
            Error::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
            Error::Detached => write!(f, "Data source is detached"),
            Error::Closed => write!(f, "Reader is closed"),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Corruption(msg) => write!(f, "Corruption: {}", msg),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) | Error::Decode(_, err) => Some(err),
            Error::FileOpenFailure { source, .. } | Error::ReadFailure { source, .. } => {
                Some(source.as_ref())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_open_failure_keeps_cause() {
        let err = Error::FileOpenFailure {
            file: "f1".to_string(),
            source: Box::new(Error::IoError(io::Error::new(
                io::ErrorKind::NotFound,
                "missing",
            ))),
        };

        assert_eq!(err.to_string(), "Failed to open f1: I/O error: missing");
        let cause = err.source().unwrap();
        assert!(cause.source().is_some());
        assert!(Error::Closed.source().is_none());
    }
}
