use crate::store::StoreError;
use thiserror::Error;

pub type AudienceResult<T> = Result<T, AudienceError>;

#[derive(Error, Debug)]
pub enum AudienceError {
    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Segment not found: {0}")]
    SegmentNotFound(String),

    #[error("Segment already exists: {0}")]
    SegmentAlreadyExists(String),

    /// One or more requested additions name a segment that does not exist.
    /// Nothing from the request was applied.
    #[error("Segments do not exist: {}", .0.join(", "))]
    SegmentsNotExist(Vec<String>),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No history for user {user_id} in {year}-{month:02}")]
    NoHistory {
        user_id: String,
        year: i32,
        month: u32,
    },

    #[error("Store error during {op}: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },
}

/// Coarse classification used by callers to decide between rejecting a
/// request and reporting a server error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Validation,
    Transient,
}

impl AudienceError {
    /// Wrap a store failure with the name of the operation that issued it.
    ///
    /// Domain outcomes reported by the store (missing rows, duplicates,
    /// unknown segments) become their caller-facing variants; everything
    /// else stays a `Store` error carrying `op`.
    pub fn store(op: &'static str, err: StoreError) -> Self {
        match err {
            StoreError::UserNotFound(user_id) => Self::UserNotFound(user_id),
            StoreError::SegmentNotFound(slug) => Self::SegmentNotFound(slug),
            StoreError::AlreadyExists(slug) => Self::SegmentAlreadyExists(slug),
            StoreError::SegmentsNotExist(missing) => Self::SegmentsNotExist(missing),
            other => Self::Store { op, source: other },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UserNotFound(_) | Self::SegmentNotFound(_) | Self::NoHistory { .. } => {
                ErrorKind::NotFound
            }
            Self::SegmentAlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::SegmentsNotExist(_) | Self::Validation(_) => ErrorKind::Validation,
            Self::Store { .. } => ErrorKind::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_store_error_mapping() {
        let err = AudienceError::store("active_segments", StoreError::UserNotFound("u1".into()));
        assert!(matches!(err, AudienceError::UserNotFound(ref id) if id == "u1"));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = AudienceError::store(
            "apply_membership",
            StoreError::SegmentsNotExist(vec!["vip".into(), "beta".into()]),
        );
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "Segments do not exist: vip, beta");
    }

    #[test]
    fn test_transient_errors_keep_operation_name() {
        let err = AudienceError::store(
            "fetch_due",
            StoreError::Timeout(Duration::from_millis(250)),
        );
        assert!(err.is_transient());
        assert!(err.to_string().starts_with("Store error during fetch_due"));
    }

    #[test]
    fn test_caller_facing_kinds() {
        let no_history = AudienceError::NoHistory {
            user_id: "u1".into(),
            year: 2024,
            month: 2,
        };
        assert_eq!(no_history.kind(), ErrorKind::NotFound);
        assert_eq!(no_history.to_string(), "No history for user u1 in 2024-02");

        let duplicate =
            AudienceError::store("create_segment", StoreError::AlreadyExists("vip".into()));
        assert_eq!(duplicate.kind(), ErrorKind::AlreadyExists);
        assert!(!duplicate.is_transient());

        let unavailable =
            AudienceError::store("append_audit", StoreError::Unavailable("down".into()));
        assert_eq!(unavailable.kind(), ErrorKind::Transient);
    }
}
