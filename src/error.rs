use thiserror::Error;

/// Failure classes a pull can surface. Call sites wrap these in `anyhow`
/// context chains; callers that need to tell the classes apart downcast to
/// this type.
#[derive(Debug, Error)]
pub enum ImportError {
    /// The URL is not an absolute http:// or https:// URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The requested local name is not a valid machine name.
    #[error("invalid machine name: {0}")]
    InvalidMachineName(String),

    /// A download for this URL is already active in the session.
    #[error("already downloading: {0}")]
    AlreadyExists(String),

    /// A byte counter would overflow.
    #[error("byte counter overflow")]
    Overflow,

    /// The image exceeds the size limit, or the body exceeds the declared
    /// content length.
    #[error("image too large (limit {limit} bytes)")]
    TooLarge { limit: u64 },

    /// Transport, HTTP, or decode failure.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// The download was cancelled.
    #[error("download cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_context() {
        let err = ImportError::InvalidUrl("ftp://x".into());
        assert!(err.to_string().contains("ftp://x"));

        let err = ImportError::TooLarge { limit: 8 };
        assert!(err.to_string().contains('8'));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = ImportError::Overflow.into();
        let err = err.context("writing image");
        assert!(matches!(
            err.downcast_ref::<ImportError>(),
            Some(ImportError::Overflow)
        ));
    }
}
