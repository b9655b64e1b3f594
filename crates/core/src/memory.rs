//! In-process implementation of the store traits.
//!
//! Backs the test suites of every crate in the workspace. Transactions take
//! the table lock for their whole lifetime and work on a staged copy, so the
//! commit/rollback contract matches the Postgres store.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::StoreError;
use crate::store::{PageDirectory, StoreTransaction, SubscriptionStore, UpdateSource};
use crate::types::{
    ChannelIdentity, NewSubscription, Page, PageComponent, PageUpdate, Subscription,
    WebhookConfig,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    next_id: i64,
    subscriptions: BTreeMap<i64, Subscription>,
}

impl Tables {
    fn find_email(&self, page_id: i64, email: &str) -> Option<&Subscription> {
        self.subscriptions
            .values()
            .find(|sub| sub.page_id == page_id && email_eq(sub, email))
    }

    fn find_webhook(&self, page_id: i64, url: &str) -> Option<&Subscription> {
        self.subscriptions.values().find(|sub| {
            sub.page_id == page_id
                && matches!(
                    &sub.identity,
                    ChannelIdentity::Webhook { url: existing, .. } if existing == url
                )
        })
    }

    fn touch(&mut self, id: i64) -> Result<&mut Subscription, StoreError> {
        let sub = self
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| StoreError::Integrity(format!("subscription {} vanished", id)))?;
        sub.updated_at = Utc::now();
        Ok(sub)
    }
}

fn email_eq(sub: &Subscription, email: &str) -> bool {
    matches!(
        &sub.identity,
        ChannelIdentity::Email { email: existing } if existing.eq_ignore_ascii_case(email)
    )
}

#[derive(Debug, Default)]
struct Catalog {
    pages: HashMap<i64, Page>,
    components: HashMap<i64, PageComponent>,
    status_report_updates: HashMap<i64, PageUpdate>,
    maintenances: HashMap<i64, PageUpdate>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    catalog: Arc<RwLock<Catalog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_page(&self, page: Page) {
        self.catalog.write().await.pages.insert(page.id, page);
    }

    pub async fn add_component(&self, component: PageComponent) {
        self.catalog
            .write()
            .await
            .components
            .insert(component.id, component);
    }

    pub async fn add_status_report_update(&self, update: PageUpdate) {
        self.catalog
            .write()
            .await
            .status_report_updates
            .insert(update.id, update);
    }

    pub async fn add_maintenance(&self, update: PageUpdate) {
        self.catalog
            .write()
            .await
            .maintenances
            .insert(update.id, update);
    }

    /// Insert or overwrite a subscription as-is, bypassing lifecycle rules.
    pub async fn put(&self, subscription: Subscription) {
        let mut tables = self.tables.lock().await;
        tables.next_id = tables.next_id.max(subscription.id);
        tables.subscriptions.insert(subscription.id, subscription);
    }

    pub async fn get(&self, id: i64) -> Option<Subscription> {
        self.tables.lock().await.subscriptions.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<Subscription> {
        self.tables
            .lock()
            .await
            .subscriptions
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryTransaction { guard, staged }))
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Subscription>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .subscriptions
            .values()
            .find(|sub| sub.token == token)
            .cloned())
    }

    async fn list_eligible_for_page(&self, page_id: i64) -> Result<Vec<Subscription>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .subscriptions
            .values()
            .filter(|sub| sub.page_id == page_id && sub.is_eligible())
            .cloned()
            .collect())
    }

    async fn list_for_page(&self, page_id: i64) -> Result<Vec<Subscription>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .subscriptions
            .values()
            .filter(|sub| sub.page_id == page_id)
            .cloned()
            .collect())
    }

    async fn mark_verified(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.subscriptions.get_mut(&id) {
            Some(sub) if sub.verified_at.is_none() => {
                sub.verified_at = Some(at);
                sub.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_unsubscribed(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.subscriptions.get_mut(&id) {
            Some(sub) if sub.unsubscribed_at.is_none() => {
                sub.unsubscribed_at = Some(at);
                sub.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn lock_email_subscription(
        &mut self,
        page_id: i64,
        email: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self.staged.find_email(page_id, email).cloned())
    }

    async fn lock_webhook_subscription(
        &mut self,
        page_id: i64,
        url: &str,
    ) -> Result<Option<Subscription>, StoreError> {
        Ok(self.staged.find_webhook(page_id, url).cloned())
    }

    async fn insert(&mut self, new: NewSubscription) -> Result<i64, StoreError> {
        let taken = match &new.identity {
            ChannelIdentity::Email { email } => self.staged.find_email(new.page_id, email),
            ChannelIdentity::Webhook { url, .. } => self.staged.find_webhook(new.page_id, url),
        };
        if taken.is_some() {
            return Err(StoreError::Conflict);
        }
        if self
            .staged
            .subscriptions
            .values()
            .any(|sub| sub.token == new.token)
        {
            return Err(StoreError::Conflict);
        }

        self.staged.next_id += 1;
        let id = self.staged.next_id;
        let now = Utc::now();
        self.staged.subscriptions.insert(
            id,
            Subscription {
                id,
                page_id: new.page_id,
                workspace_id: new.workspace_id,
                identity: new.identity,
                token: new.token,
                expires_at: new.expires_at,
                verified_at: new.verified_at,
                unsubscribed_at: None,
                component_ids: new.component_ids,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn reactivate(
        &mut self,
        id: i64,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sub = self.staged.touch(id)?;
        sub.token = token.to_string();
        sub.expires_at = expires_at;
        sub.verified_at = None;
        sub.unsubscribed_at = None;
        Ok(())
    }

    async fn refresh_webhook(
        &mut self,
        id: i64,
        config: &WebhookConfig,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sub = self.staged.touch(id)?;
        let ChannelIdentity::Webhook { config: current, .. } = &mut sub.identity else {
            return Err(StoreError::Integrity(format!("subscription {} is not a webhook", id)));
        };
        *current = config.clone();
        sub.verified_at.get_or_insert(at);
        sub.unsubscribed_at = None;
        Ok(())
    }

    async fn extend_expiry(
        &mut self,
        id: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.staged.touch(id)?.expires_at = expires_at;
        Ok(())
    }

    async fn replace_scope(
        &mut self,
        id: i64,
        component_ids: &BTreeSet<i64>,
    ) -> Result<(), StoreError> {
        self.staged.touch(id)?.component_ids = component_ids.clone();
        Ok(())
    }

    async fn get(&mut self, id: i64) -> Result<Option<Subscription>, StoreError> {
        Ok(self.staged.subscriptions.get(&id).cloned())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { mut guard, staged } = *self;
        *guard = staged;
        Ok(())
    }
}

#[async_trait]
impl PageDirectory for MemoryStore {
    async fn get_page(&self, page_id: i64) -> Result<Option<Page>, StoreError> {
        Ok(self.catalog.read().await.pages.get(&page_id).cloned())
    }

    async fn list_components(
        &self,
        _page_id: i64,
        ids: &[i64],
    ) -> Result<Vec<PageComponent>, StoreError> {
        let catalog = self.catalog.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| catalog.components.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl UpdateSource for MemoryStore {
    async fn status_report_update(&self, id: i64) -> Result<Option<PageUpdate>, StoreError> {
        Ok(self
            .catalog
            .read()
            .await
            .status_report_updates
            .get(&id)
            .cloned())
    }

    async fn maintenance_update(&self, id: i64) -> Result<Option<PageUpdate>, StoreError> {
        Ok(self.catalog.read().await.maintenances.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_email(page_id: i64, email: &str, token: &str) -> NewSubscription {
        NewSubscription {
            page_id,
            workspace_id: None,
            identity: ChannelIdentity::Email {
                email: email.to_string(),
            },
            token: token.to_string(),
            expires_at: Utc::now() + Duration::days(7),
            verified_at: None,
            component_ids: BTreeSet::new(),
        }
    }

    #[tokio::test]
    async fn test_dropped_transaction_discards_writes() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert(new_email(1, "a@x.com", "t1")).await.unwrap();
        }
        assert!(store.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert(new_email(1, "a@x.com", "t1")).await.unwrap();
        tx.replace_scope(id, &BTreeSet::from([4, 5])).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.find_by_token("t1").await.unwrap().unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.component_ids, BTreeSet::from([4, 5]));
    }

    #[tokio::test]
    async fn test_duplicate_email_conflicts() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.insert(new_email(1, "a@x.com", "t1")).await.unwrap();
        let err = tx.insert(new_email(1, "A@x.com", "t2")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
        // same address on another page is fine
        assert!(tx.insert(new_email(2, "a@x.com", "t3")).await.is_ok());
    }

    #[tokio::test]
    async fn test_mark_verified_only_once() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        let id = tx.insert(new_email(1, "a@x.com", "t1")).await.unwrap();
        tx.commit().await.unwrap();

        assert!(store.mark_verified(id, Utc::now()).await.unwrap());
        assert!(!store.mark_verified(id, Utc::now()).await.unwrap());
    }
}
