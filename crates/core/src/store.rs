//! Persistence seams.
//!
//! Every multi-row mutation goes through a [`StoreTransaction`] obtained from
//! [`SubscriptionStore::begin`]. Writes become visible on `commit`; dropping
//! the transaction discards them.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::types::{
    NewSubscription, Page, PageComponent, PageUpdate, Subscription, WebhookConfig,
};

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    async fn find_by_token(&self, token: &str) -> Result<Option<Subscription>, StoreError>;

    /// Verified and not unsubscribed, with scopes. One entry per subscription.
    async fn list_eligible_for_page(&self, page_id: i64) -> Result<Vec<Subscription>, StoreError>;

    async fn list_for_page(&self, page_id: i64) -> Result<Vec<Subscription>, StoreError>;

    /// Sets `verified_at` if still unset. Returns whether a row changed.
    async fn mark_verified(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Sets `unsubscribed_at` if still unset. Returns whether a row changed.
    async fn mark_unsubscribed(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait StoreTransaction: Send {
    /// Email subscription for `(page_id, email)`, locked until commit.
    async fn lock_email_subscription(
        &mut self,
        page_id: i64,
        email: &str,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Webhook subscription for `(page_id, url)`, locked until commit.
    async fn lock_webhook_subscription(
        &mut self,
        page_id: i64,
        url: &str,
    ) -> Result<Option<Subscription>, StoreError>;

    /// Inserts the row and its scope. Fails with [`StoreError::Conflict`]
    /// when the page already has a subscription for the same email or
    /// webhook URL.
    async fn insert(&mut self, new: NewSubscription) -> Result<i64, StoreError>;

    /// Back to pending: new token and deadline, both timestamps cleared.
    async fn reactivate(
        &mut self,
        id: i64,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Replaces the webhook config and makes the row active again: keeps
    /// `verified_at` (or sets it to `at`) and clears `unsubscribed_at`.
    async fn refresh_webhook(
        &mut self,
        id: i64,
        config: &WebhookConfig,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn extend_expiry(&mut self, id: i64, expires_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Delete-then-insert of the scope rows.
    async fn replace_scope(
        &mut self,
        id: i64,
        component_ids: &BTreeSet<i64>,
    ) -> Result<(), StoreError>;

    async fn get(&mut self, id: i64) -> Result<Option<Subscription>, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Page and component lookups owned by the page module.
#[async_trait]
pub trait PageDirectory: Send + Sync {
    async fn get_page(&self, page_id: i64) -> Result<Option<Page>, StoreError>;

    /// Components among `ids` that exist, regardless of which page owns them.
    async fn list_components(
        &self,
        page_id: i64,
        ids: &[i64],
    ) -> Result<Vec<PageComponent>, StoreError>;
}

/// Normalises producer records into [`PageUpdate`]s.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn status_report_update(&self, id: i64) -> Result<Option<PageUpdate>, StoreError>;

    async fn maintenance_update(&self, id: i64) -> Result<Option<PageUpdate>, StoreError>;
}
