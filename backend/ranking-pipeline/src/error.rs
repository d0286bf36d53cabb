use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid feature name: {0}")]
    InvalidFeatureName(String),

    #[error("Feature store error: {0}")]
    FeatureStore(String),

    #[error("Real-time feature {component} failed: {message}")]
    RealtimeFeature { component: String, message: String },

    #[error("Model inference failed: {0}")]
    Inference(String),

    #[error("Model {model} returned {actual} outputs for a batch of {expected}")]
    BatchLengthMismatch {
        model: String,
        expected: usize,
        actual: usize,
    },

    #[error("Model {0} returned no output for the request")]
    MissingModelOutput(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Pagination error: {0}")]
    Pagination(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classes surfaced to callers of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Fetch,
    Inference,
    Validation,
    Configuration,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Fetch => "fetch",
            ErrorKind::Inference => "inference",
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::FeatureStore(_)
            | PipelineError::RealtimeFeature { .. }
            | PipelineError::Timeout(_) => ErrorKind::Fetch,
            PipelineError::Inference(_)
            | PipelineError::BatchLengthMismatch { .. }
            | PipelineError::MissingModelOutput(_) => ErrorKind::Inference,
            PipelineError::InvalidFeatureName(_)
            | PipelineError::Pagination(_)
            | PipelineError::Validation(_) => ErrorKind::Validation,
            PipelineError::Configuration(_) => ErrorKind::Configuration,
            PipelineError::Serialization(_) | PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a `handle_exceptions` caller may swallow this error.
    /// Validation and configuration errors are always fatal.
    pub fn is_isolatable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fetch | ErrorKind::Inference)
    }

    pub fn realtime(component: impl Into<String>, message: impl std::fmt::Display) -> Self {
        PipelineError::RealtimeFeature {
            component: component.into(),
            message: message.to_string(),
        }
    }
}

// Implement conversions from other error types
impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PipelineError::Timeout(err.to_string())
        } else if err.is_decode() {
            PipelineError::FeatureStore(format!("undecodable response: {}", err))
        } else {
            PipelineError::FeatureStore(err.to_string())
        }
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::Configuration(err.to_string())
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            PipelineError::FeatureStore("down".into()).kind(),
            ErrorKind::Fetch
        );
        assert_eq!(PipelineError::Timeout("store".into()).kind(), ErrorKind::Fetch);
        assert_eq!(
            PipelineError::BatchLengthMismatch {
                model: "m".into(),
                expected: 2,
                actual: 1
            }
            .kind(),
            ErrorKind::Inference
        );
        assert_eq!(
            PipelineError::Pagination("bad page".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(ErrorKind::Configuration.as_str(), "configuration");
    }

    #[test]
    fn test_only_fetch_and_inference_errors_are_isolatable() {
        assert!(PipelineError::realtime("rt", "boom").is_isolatable());
        assert!(PipelineError::Inference("backend".into()).is_isolatable());
        assert!(!PipelineError::InvalidFeatureName("f1".into()).is_isolatable());
        assert!(!PipelineError::Configuration("missing key".into()).is_isolatable());
    }

    #[test]
    fn test_realtime_error_message() {
        let err = PipelineError::realtime("matched_query", "no title");
        assert_eq!(
            err.to_string(),
            "Real-time feature matched_query failed: no title"
        );
    }
}
