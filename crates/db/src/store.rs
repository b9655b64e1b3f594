//! Postgres implementation of the store traits.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use statuscast_core::error::StoreError;
use statuscast_core::store::{PageDirectory, StoreTransaction, SubscriptionStore, UpdateSource};
use statuscast_core::types::{
    NewSubscription, Page, PageComponent, PageUpdate, Subscription, WebhookConfig,
};

use crate::models::{identity_columns, SubscriptionRow};
use crate::queries;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn map_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::Conflict,
        _ => StoreError::backend(err),
    }
}

fn into_subscriptions(rows: Vec<SubscriptionRow>) -> Result<Vec<Subscription>, StoreError> {
    rows.into_iter().map(Subscription::try_from).collect()
}

fn expect_one(affected: u64, id: i64) -> Result<(), StoreError> {
    if affected == 0 {
        return Err(StoreError::Integrity(format!("subscription {} vanished", id)));
    }
    Ok(())
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(map_err)?;
        Ok(Box::new(PgTransaction { tx }))
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Subscription>, StoreError> {
        queries::subscriptions::get_by_token(&self.pool, token)
            .await
            .map_err(map_err)?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn list_eligible_for_page(&self, page_id: i64) -> Result<Vec<Subscription>, StoreError> {
        let rows = queries::subscriptions::list_eligible_for_page(&self.pool, page_id)
            .await
            .map_err(map_err)?;
        into_subscriptions(rows)
    }

    async fn list_for_page(&self, page_id: i64) -> Result<Vec<Subscription>, StoreError> {
        let rows = queries::subscriptions::list_for_page(&self.pool, page_id)
            .await
            .map_err(map_err)?;
        into_subscriptions(rows)
    }

    async fn mark_verified(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let affected = queries::subscriptions::mark_verified(&self.pool, id, at)
            .await
            .map_err(map_err)?;
        Ok(affected > 0)
    }

    async fn mark_unsubscribed(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let affected = queries::subscriptions::mark_unsubscribed(&self.pool, id, at)
            .await
            .map_err(map_err)?;
        Ok(affected > 0)
    }
}

/// Rolled back by sqlx when dropped without `commit`.
struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn lock_email_subscription(
        &mut self,
        page_id: i64,
        email: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        let Some(id) = queries::subscriptions::lock_email(&mut *self.tx, page_id, email)
            .await
            .map_err(map_err)?
        else {
            return Ok(None);
        };
        self.get(id).await
    }

    async fn lock_webhook_subscription(
        &mut self,
        page_id: i64,
        url: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        let Some(id) = queries::subscriptions::lock_webhook(&mut *self.tx, page_id, url)
            .await
            .map_err(map_err)?
        else {
            return Ok(None);
        };
        self.get(id).await
    }

    async fn insert(&mut self, new: NewSubscription) -> Result<i64, StoreError> {
        let (channel_type, email, webhook_url, channel_config) =
            identity_columns(&new.identity)?;
        let id = queries::subscriptions::insert(
            &mut *self.tx,
            new.page_id,
            new.workspace_id,
            channel_type.as_str(),
            email,
            webhook_url,
            channel_config,
            &new.token,
            new.expires_at,
            new.verified_at,
        )
        .await
        .map_err(map_err)?;

        if !new.component_ids.is_empty() {
            let component_ids: Vec<i64> = new.component_ids.iter().copied().collect();
            queries::subscriptions::insert_components(&mut *self.tx, id, &component_ids)
                .await
                .map_err(map_err)?;
        }
        Ok(id)
    }

    async fn reactivate(
        &mut self,
        id: i64,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let affected = queries::subscriptions::reactivate(&mut *self.tx, id, token, expires_at)
            .await
            .map_err(map_err)?;
        expect_one(affected, id)
    }

    async fn refresh_webhook(
        &mut self,
        id: i64,
        config: &WebhookConfig,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let config = serde_json::to_value(config).map_err(StoreError::backend)?;
        let affected = queries::subscriptions::refresh_webhook(&mut *self.tx, id, config, at)
            .await
            .map_err(map_err)?;
        expect_one(affected, id)
    }

    async fn extend_expiry(
        &mut self,
        id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let affected = queries::subscriptions::extend_expiry(&mut *self.tx, id, expires_at)
            .await
            .map_err(map_err)?;
        expect_one(affected, id)
    }

    async fn replace_scope(
        &mut self,
        id: i64,
        component_ids: &BTreeSet<i64>,
    ) -> Result<(), StoreError> {
        queries::subscriptions::delete_components(&mut *self.tx, id)
            .await
            .map_err(map_err)?;
        if !component_ids.is_empty() {
            let component_ids: Vec<i64> = component_ids.iter().copied().collect();
            queries::subscriptions::insert_components(&mut *self.tx, id, &component_ids)
                .await
                .map_err(map_err)?;
        }
        let affected = queries::subscriptions::touch(&mut *self.tx, id)
            .await
            .map_err(map_err)?;
        expect_one(affected, id)
    }

    async fn get(&mut self, id: i64) -> Result<Option<Subscription>, StoreError> {
        queries::subscriptions::get_by_id(&mut *self.tx, id)
            .await
            .map_err(map_err)?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_err)
    }
}

#[async_trait]
impl PageDirectory for PgStore {
    async fn get_page(&self, page_id: i64) -> Result<Option<Page>, StoreError> {
        let row = queries::pages::get_by_id(&self.pool, page_id)
            .await
            .map_err(map_err)?;
        Ok(row.map(Page::from))
    }

    async fn list_components(
        &self,
        _page_id: i64,
        ids: &[i64],
    ) -> Result<Vec<PageComponent>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = queries::components::list_by_ids(&self.pool, ids)
            .await
            .map_err(map_err)?;
        Ok(rows.into_iter().map(PageComponent::from).collect())
    }
}

#[async_trait]
impl UpdateSource for PgStore {
    async fn status_report_update(&self, id: i64) -> Result<Option<PageUpdate>, StoreError> {
        queries::status_reports::get_update(&self.pool, id)
            .await
            .map_err(map_err)?
            .map(PageUpdate::try_from)
            .transpose()
    }

    async fn maintenance_update(&self, id: i64) -> Result<Option<PageUpdate>, StoreError> {
        queries::maintenances::get_update(&self.pool, id)
            .await
            .map_err(map_err)?
            .map(PageUpdate::try_from)
            .transpose()
    }
}
