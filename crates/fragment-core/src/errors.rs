use std::time::Duration;

/// Failure of a room-provider call. Every provider call may fail and may
/// already have had a visible effect on the platform.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl ProviderError {
    /// The platform no longer knows the referenced room or member.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Transient failures that may succeed on a later event.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    /// Short classification string for logs and RPC error payloads.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Forbidden(_) => "forbidden",
            Self::Rejected(_) => "rejected",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Map an error kind reported by a remote provider back into a variant.
    pub fn from_kind(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "not_found" => Self::NotFound(message),
            "forbidden" => Self::Forbidden(message),
            "unavailable" => Self::Unavailable(message),
            _ => Self::Rejected(message),
        }
    }
}

/// The fragment registry could not answer a lookup.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("registry error: {0}")]
pub struct RegistryError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(ProviderError::NotFound("room".into()).is_not_found());
        assert!(!ProviderError::Forbidden("x".into()).is_not_found());
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ProviderError::Unavailable("down".into()).is_transient());
        assert!(!ProviderError::Rejected("bad".into()).is_transient());
    }

    #[test]
    fn kind_roundtrip() {
        for err in [
            ProviderError::NotFound("a".into()),
            ProviderError::Forbidden("b".into()),
            ProviderError::Rejected("c".into()),
            ProviderError::Unavailable("d".into()),
        ] {
            let back = ProviderError::from_kind(err.error_kind(), "m");
            assert_eq!(back.error_kind(), err.error_kind());
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(matches!(
            ProviderError::from_kind("weird", "m"),
            ProviderError::Rejected(_)
        ));
    }
}
