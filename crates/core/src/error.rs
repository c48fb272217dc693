use serde::Serialize;
use thiserror::Error;

pub type PricingResult<T> = Result<T, PricingError>;

#[derive(Error, Debug)]
pub enum PricingError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// The four error kinds exposed to callers of the surface operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    Internal,
}

impl PricingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PricingError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PricingError::NotFound(_) => ErrorKind::NotFound,
            PricingError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            PricingError::Config(_)
            | PricingError::Serialization(_)
            | PricingError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        PricingError::InvalidArgument(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        PricingError::NotFound(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        PricingError::FailedPrecondition(msg.into())
    }
}

impl From<config::ConfigError> for PricingError {
    fn from(e: config::ConfigError) -> Self {
        PricingError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(PricingError::invalid("x").kind(), ErrorKind::InvalidArgument);
        assert_eq!(PricingError::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(
            PricingError::precondition("x").kind(),
            ErrorKind::FailedPrecondition
        );
        assert_eq!(
            PricingError::Config("bad".into()).kind(),
            ErrorKind::Internal
        );
        let internal: PricingError = anyhow::anyhow!("boom").into();
        assert_eq!(internal.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::FailedPrecondition).unwrap();
        assert_eq!(json, "\"failed_precondition\"");
    }
}
