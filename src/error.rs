use thiserror::Error;

/// Caller-facing failure taxonomy for pipeline operations.
///
/// Failures that happen after a Detection row exists never surface here; they
/// are folded into the Detection's `failed` status and diagnostic payload.
#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Referenced media, detection, object, item or location does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// Media file missing on storage or undecodable before analysis started.
    #[error("media unreadable: {0}")]
    MediaUnreadable(String),

    /// Detector or embedder backend is missing.
    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    /// Caller supplied parameters outside their valid range.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Persistence or inference failure inside the system.
    #[error("internal failure: {0:#}")]
    Internal(#[from] anyhow::Error),
}

impl AnalysisError {
    pub fn not_found(kind: &'static str, id: i64) -> Self {
        Self::NotFound { kind, id }
    }

    /// True for errors caused by the request rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::MediaUnreadable(_) | Self::InvalidInput(_)
        )
    }
}

impl From<rusqlite::Error> for AnalysisError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal(err.into())
    }
}

impl From<serde_json::Error> for AnalysisError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(err.into())
    }
}

pub type AnalysisResult<T> = std::result::Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_classified() {
        assert!(AnalysisError::not_found("media", 7).is_client_error());
        assert!(AnalysisError::MediaUnreadable("gone".into()).is_client_error());
        assert!(AnalysisError::InvalidInput("stride".into()).is_client_error());
        assert!(!AnalysisError::CapabilityUnavailable("clip".into()).is_client_error());
        assert!(!AnalysisError::Internal(anyhow::anyhow!("disk")).is_client_error());
    }

    #[test]
    fn not_found_message_names_the_kind() {
        let err = AnalysisError::not_found("location", 12);
        assert_eq!(err.to_string(), "location 12 not found");
    }
}
