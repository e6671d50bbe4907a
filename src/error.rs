use crate::model::BookId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("book {0} is already active")]
    DuplicateKey(BookId),

    #[error("no active book with id {0}")]
    NotFound(BookId),

    #[error("book {id} is locked by another mutation (gave up after {attempts} attempts)")]
    ConcurrentModification { id: BookId, attempts: u32 },

    #[error("clock skew on book {id}: now {now} is not after last recorded boundary {last}")]
    ClockSkew { id: BookId, now: u64, last: u64 },

    #[error("journal i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("poisoned lock: {0}")]
    Poisoned(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("field '{0}' is server-generated and cannot be written")]
    ReadOnlyField(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal: {0}")]
    Internal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type ApiResult<T> = Result<T, ApiError>;

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::DuplicateKey(_) => "DUPLICATE_KEY",
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            StoreError::ClockSkew { .. } => "CLOCK_SKEW",
            StoreError::Io(_) => "IO",
            StoreError::Poisoned(_) => "INTERNAL",
        }
    }

    /// Whether the caller can expect the same request to succeed later.
    pub fn retryable(&self) -> bool {
        matches!(self, StoreError::ConcurrentModification { .. } | StoreError::ClockSkew { .. })
    }

    pub fn status(&self) -> u16 {
        match self {
            StoreError::DuplicateKey(_) => 409,
            StoreError::NotFound(_) => 404,
            StoreError::ConcurrentModification { .. } | StoreError::ClockSkew { .. } => 503,
            StoreError::Io(_) | StoreError::Poisoned(_) => 500,
        }
    }
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION",
            ApiError::ReadOnlyField(_) => "READ_ONLY_FIELD",
            ApiError::Store(e) => e.code(),
            ApiError::Internal(_) => "INTERNAL",
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            ApiError::Store(e) => e.retryable(),
            _ => false,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ApiError::Validation(_) | ApiError::ReadOnlyField(_) => 400,
            ApiError::Store(e) => e.status(),
            ApiError::Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct_per_kind() {
        let errs = [
            ApiError::from(StoreError::DuplicateKey(1)),
            ApiError::from(StoreError::NotFound(1)),
            ApiError::from(StoreError::ConcurrentModification { id: 1, attempts: 3 }),
            ApiError::from(StoreError::ClockSkew { id: 1, now: 5, last: 5 }),
            ApiError::Validation("x".into()),
            ApiError::ReadOnlyField("validFrom".into()),
        ];
        let mut codes: Vec<_> = errs.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }

    #[test]
    fn only_contention_and_skew_are_retryable() {
        assert!(StoreError::ConcurrentModification { id: 1, attempts: 1 }.retryable());
        assert!(StoreError::ClockSkew { id: 1, now: 1, last: 2 }.retryable());
        assert!(!StoreError::NotFound(1).retryable());
        assert!(!ApiError::Validation("bad".into()).retryable());
    }
}
