//! Delivery channels for page subscriptions.
//!
//! A [`Channel`] knows how to validate its configuration, send the one-off
//! verification message and deliver a batch of update notifications. It has
//! no knowledge of scopes or eligibility; callers hand it exactly the
//! subscriptions that should be notified.

pub mod email;
pub mod email_client;
pub mod registry;
pub mod webhook;

use async_trait::async_trait;
use statuscast_core::types::{ChannelType, Page, PageUpdate, Subscription};

pub use email::EmailChannel;
pub use email_client::{BatchedUpdate, EmailClient, EmailClientError, HttpEmailClient, Recipient};
pub use registry::ChannelRegistry;
pub use webhook::WebhookChannel;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("invalid channel config: {0}")]
    InvalidConfig(String),
    #[error("subscription {subscription_id} has no {field}")]
    MissingField {
        subscription_id: i64,
        field: &'static str,
    },
    #[error(transparent)]
    Email(#[from] EmailClientError),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome of one `send_notifications` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sent: usize,
    pub failed: usize,
}

#[async_trait]
pub trait Channel: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    /// Pure validation of a channel-specific config document.
    fn validate_config(&self, config: &serde_json::Value) -> Result<(), ChannelError>;

    /// Sends the verification message. Channels without a verification step
    /// only assert that the subscription carries their identity.
    async fn send_verification(
        &self,
        subscription: &Subscription,
        page: &Page,
        verify_url: &str,
    ) -> Result<(), ChannelError>;

    /// Delivers `update` to every subscription in `subscriptions` that
    /// carries this channel's identity.
    async fn send_notifications(
        &self,
        subscriptions: &[Subscription],
        page: &Page,
        update: &PageUpdate,
    ) -> Result<DeliveryReport, ChannelError>;
}
