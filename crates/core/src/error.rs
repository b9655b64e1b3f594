use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write, usually a concurrent
    /// first subscription for the same address.
    #[error("conflicting write")]
    Conflict,
    #[error("corrupt row: {0}")]
    Integrity(String),
    #[error("store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

/// Errors surfaced to callers of the subscription service. Messages are
/// written to be shown to end users as-is.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Please enter a valid email address")]
    InvalidEmail,
    #[error(
        "All page components must belong to the same page (invalid components: {})",
        join_ids(.component_ids)
    )]
    InvalidScope { component_ids: Vec<i64> },
    #[error("Page not found")]
    PageNotFound,
    /// Unknown token and domain mismatch both end up here.
    #[error("Subscription not found")]
    NotFound,
    #[error("This verification link has expired. Please subscribe again")]
    TokenExpired,
    #[error("You are already unsubscribed")]
    AlreadyUnsubscribed,
    #[error("Invalid channel configuration: {0}")]
    InvalidChannelConfig(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_scope_lists_offending_ids() {
        let err = SubscriptionError::InvalidScope {
            component_ids: vec![3, 9],
        };
        assert_eq!(
            err.to_string(),
            "All page components must belong to the same page (invalid components: 3, 9)"
        );
    }

    #[test]
    fn test_store_error_is_transparent() {
        let err: SubscriptionError = StoreError::Conflict.into();
        assert_eq!(err.to_string(), "conflicting write");
    }
}
