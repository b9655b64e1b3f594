//! Subscription lifecycle: subscribe, verify, rescope, unsubscribe.
//!
//! Lifecycle state is derived from timestamps (see
//! [`Subscription::state`]). Re-subscribing is idempotent: an active
//! subscription merges the requested scope, an unsubscribed one is
//! reactivated with a fresh token and the requested scope replaces the old.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::email::normalize_email;
use crate::error::{StoreError, SubscriptionError};
use crate::scope;
use crate::store::{PageDirectory, SubscriptionStore};
use crate::token::generate_token;
use crate::types::{
    ChannelIdentity, NewSubscription, Page, Subscription, SubscriptionSummary, WebhookConfig,
};
use crate::webhook;

pub const DEFAULT_VERIFICATION_TTL_DAYS: i64 = 7;

pub type ServiceResult<T> = Result<T, SubscriptionError>;

pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    pages: Arc<dyn PageDirectory>,
    verification_ttl: Duration,
    production: bool,
}

struct Resolved {
    subscription: Subscription,
    page: Option<Page>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn SubscriptionStore>, pages: Arc<dyn PageDirectory>) -> Self {
        Self {
            store,
            pages,
            verification_ttl: Duration::days(DEFAULT_VERIFICATION_TTL_DAYS),
            production: false,
        }
    }

    pub fn with_verification_ttl(mut self, ttl: Duration) -> Self {
        self.verification_ttl = ttl;
        self
    }

    /// Production mode rejects webhook targets on localhost.
    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    pub async fn get_page(&self, page_id: i64) -> ServiceResult<Page> {
        self.pages
            .get_page(page_id)
            .await?
            .ok_or(SubscriptionError::PageNotFound)
    }

    pub async fn upsert_email_subscription(
        &self,
        email: &str,
        page_id: i64,
        component_ids: &[i64],
    ) -> ServiceResult<Subscription> {
        let email = normalize_email(email)?;
        let page = self.get_page(page_id).await?;
        let requested: BTreeSet<i64> = component_ids.iter().copied().collect();
        self.validate_scope(page_id, &requested).await?;

        retry_on_conflict(page_id, || self.upsert_email_once(&page, &email, &requested)).await
    }

    async fn upsert_email_once(
        &self,
        page: &Page,
        email: &str,
        requested: &BTreeSet<i64>,
    ) -> ServiceResult<Subscription> {
        let expires_at = Utc::now() + self.verification_ttl;
        let mut tx = self.store.begin().await?;

        let id = match tx.lock_email_subscription(page.id, email).await? {
            Some(existing) if existing.unsubscribed_at.is_some() => {
                tx.reactivate(existing.id, &generate_token(), expires_at)
                    .await?;
                tx.replace_scope(existing.id, requested).await?;
                info!(
                    subscription_id = existing.id,
                    page_id = page.id,
                    "subscription reactivated"
                );
                existing.id
            }
            Some(existing) => {
                let merged = scope::merge(&existing.component_ids, requested);
                if merged != existing.component_ids {
                    tx.replace_scope(existing.id, &merged).await?;
                }
                if existing.verified_at.is_none() {
                    tx.extend_expiry(existing.id, expires_at).await?;
                }
                debug!(
                    subscription_id = existing.id,
                    page_id = page.id,
                    "subscription scope merged"
                );
                existing.id
            }
            None => {
                let id = tx
                    .insert(NewSubscription {
                        page_id: page.id,
                        workspace_id: page.workspace_id,
                        identity: ChannelIdentity::Email {
                            email: email.to_string(),
                        },
                        token: generate_token(),
                        expires_at,
                        verified_at: None,
                        component_ids: requested.clone(),
                    })
                    .await?;
                info!(subscription_id = id, page_id = page.id, "subscription created");
                id
            }
        };

        let subscription = tx.get(id).await?.ok_or_else(|| missing_after_write(id))?;
        tx.commit().await?;
        Ok(subscription)
    }

    /// Webhook subscriptions are created by the page owner, who is also the
    /// recipient, so they start out verified. A page holds one row per URL:
    /// creating an existing target again merges the scope and replaces the
    /// config, and an unsubscribed target is reactivated with a fresh token.
    pub async fn create_webhook_subscription(
        &self,
        page_id: i64,
        url: &str,
        config: WebhookConfig,
        component_ids: &[i64],
    ) -> ServiceResult<Subscription> {
        let url = webhook::validate_url(url, self.production)
            .map_err(SubscriptionError::InvalidChannelConfig)?;
        webhook::validate_config(&config).map_err(SubscriptionError::InvalidChannelConfig)?;

        let page = self.get_page(page_id).await?;
        let requested: BTreeSet<i64> = component_ids.iter().copied().collect();
        self.validate_scope(page_id, &requested).await?;

        let url = url.to_string();
        retry_on_conflict(page_id, || {
            self.upsert_webhook_once(&page, &url, &config, &requested)
        })
        .await
    }

    async fn upsert_webhook_once(
        &self,
        page: &Page,
        url: &str,
        config: &WebhookConfig,
        requested: &BTreeSet<i64>,
    ) -> ServiceResult<Subscription> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        let id = match tx.lock_webhook_subscription(page.id, url).await? {
            Some(existing) => {
                let scope = if existing.unsubscribed_at.is_some() {
                    tx.reactivate(existing.id, &generate_token(), now).await?;
                    requested.clone()
                } else {
                    scope::merge(&existing.component_ids, requested)
                };
                if scope != existing.component_ids {
                    tx.replace_scope(existing.id, &scope).await?;
                }
                tx.refresh_webhook(existing.id, config, now).await?;
                info!(
                    subscription_id = existing.id,
                    page_id = page.id,
                    "webhook subscription updated"
                );
                existing.id
            }
            None => {
                let id = tx
                    .insert(NewSubscription {
                        page_id: page.id,
                        workspace_id: page.workspace_id,
                        identity: ChannelIdentity::Webhook {
                            url: url.to_string(),
                            config: config.clone(),
                        },
                        token: generate_token(),
                        expires_at: now,
                        verified_at: Some(now),
                        component_ids: requested.clone(),
                    })
                    .await?;
                info!(subscription_id = id, page_id = page.id, "webhook subscription created");
                id
            }
        };

        let subscription = tx.get(id).await?.ok_or_else(|| missing_after_write(id))?;
        tx.commit().await?;
        Ok(subscription)
    }

    /// Unknown tokens and domain mismatches yield `Ok(None)`.
    pub async fn verify_subscription(
        &self,
        token: &str,
        domain: Option<&str>,
    ) -> ServiceResult<Option<Subscription>> {
        let Some(Resolved { subscription, .. }) = self.resolve(token, domain).await? else {
            return Ok(None);
        };

        if subscription.verified_at.is_some() {
            return Ok(Some(subscription));
        }

        let now = Utc::now();
        if subscription.is_expired(now) {
            return Err(SubscriptionError::TokenExpired);
        }

        if !self.store.mark_verified(subscription.id, now).await? {
            // verified concurrently; return whatever won
            return Ok(self.store.find_by_token(token).await?);
        }

        info!(
            subscription_id = subscription.id,
            page_id = subscription.page_id,
            "subscription verified"
        );
        Ok(Some(Subscription {
            verified_at: Some(now),
            updated_at: now,
            ..subscription
        }))
    }

    /// Replaces the scope wholesale.
    pub async fn update_subscription_scope(
        &self,
        token: &str,
        component_ids: &[i64],
        domain: Option<&str>,
    ) -> ServiceResult<Subscription> {
        let Resolved { subscription, .. } = self
            .resolve(token, domain)
            .await?
            .ok_or(SubscriptionError::NotFound)?;

        let requested: BTreeSet<i64> = component_ids.iter().copied().collect();
        self.validate_scope(subscription.page_id, &requested).await?;

        let mut tx = self.store.begin().await?;
        tx.replace_scope(subscription.id, &requested).await?;
        let updated = tx
            .get(subscription.id)
            .await?
            .ok_or(SubscriptionError::NotFound)?;
        tx.commit().await?;

        debug!(subscription_id = subscription.id, "subscription scope replaced");
        Ok(updated)
    }

    pub async fn unsubscribe(&self, token: &str, domain: Option<&str>) -> ServiceResult<()> {
        let Resolved { subscription, .. } = self
            .resolve(token, domain)
            .await?
            .ok_or(SubscriptionError::NotFound)?;

        if subscription.unsubscribed_at.is_some() {
            return Err(SubscriptionError::AlreadyUnsubscribed);
        }
        if !self
            .store
            .mark_unsubscribed(subscription.id, Utc::now())
            .await?
        {
            return Err(SubscriptionError::AlreadyUnsubscribed);
        }

        info!(
            subscription_id = subscription.id,
            page_id = subscription.page_id,
            "unsubscribed"
        );
        Ok(())
    }

    /// Read path for management pages. The email comes back masked.
    pub async fn get_subscription_by_token(
        &self,
        token: &str,
        domain: Option<&str>,
    ) -> ServiceResult<Option<SubscriptionSummary>> {
        let Some(Resolved { subscription, page }) = self.resolve(token, domain).await? else {
            return Ok(None);
        };
        let page = match page {
            Some(page) => Some(page),
            None => self.pages.get_page(subscription.page_id).await?,
        };
        Ok(Some(subscription.summary(page.as_ref())))
    }

    pub async fn list_page_subscriptions(
        &self,
        page_id: i64,
    ) -> ServiceResult<Vec<SubscriptionSummary>> {
        let page = self.get_page(page_id).await?;
        let subscriptions = self.store.list_for_page(page_id).await?;
        Ok(subscriptions
            .iter()
            .map(|subscription| subscription.summary(Some(&page)))
            .collect())
    }

    async fn resolve(&self, token: &str, domain: Option<&str>) -> ServiceResult<Option<Resolved>> {
        if token.is_empty() {
            return Ok(None);
        }
        let Some(subscription) = self.store.find_by_token(token).await? else {
            return Ok(None);
        };

        let Some(domain) = domain else {
            return Ok(Some(Resolved {
                subscription,
                page: None,
            }));
        };

        match self.pages.get_page(subscription.page_id).await? {
            Some(page) if page.matches_domain(domain) => Ok(Some(Resolved {
                subscription,
                page: Some(page),
            })),
            _ => Ok(None),
        }
    }

    async fn validate_scope(&self, page_id: i64, requested: &BTreeSet<i64>) -> ServiceResult<()> {
        if requested.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = requested.iter().copied().collect();
        let known = self.pages.list_components(page_id, &ids).await?;
        let invalid = scope::invalid_components(page_id, requested, &known);
        if !invalid.is_empty() {
            return Err(SubscriptionError::InvalidScope {
                component_ids: invalid,
            });
        }
        Ok(())
    }
}

/// Runs `attempt` again once when it lost an insert race to a concurrent
/// first subscription. The row exists by then, so the retry merges into it.
async fn retry_on_conflict<T, F, Fut>(page_id: i64, mut attempt: F) -> ServiceResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ServiceResult<T>>,
{
    match attempt().await {
        Err(SubscriptionError::Store(StoreError::Conflict)) => {
            debug!(page_id, "subscription insert conflict, retrying");
            attempt().await
        }
        other => other,
    }
}

fn missing_after_write(id: i64) -> StoreError {
    StoreError::Integrity(format!("subscription {} missing after write", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::DateTime;

    use crate::memory::MemoryStore;
    use crate::store::StoreTransaction;
    use crate::types::{PageComponent, SubscriptionState, WebhookHeader};

    async fn setup() -> (MemoryStore, SubscriptionService) {
        let store = MemoryStore::new();
        store
            .add_page(Page {
                id: 1,
                workspace_id: Some(9),
                title: "Acme Status".to_string(),
                slug: "acme".to_string(),
                custom_domain: Some("status.acme.com".to_string()),
            })
            .await;
        store
            .add_page(Page {
                id: 2,
                workspace_id: Some(9),
                title: "Other".to_string(),
                slug: "other".to_string(),
                custom_domain: None,
            })
            .await;
        for (id, page_id, name) in [(10, 1, "API"), (11, 1, "Dashboard"), (20, 2, "Elsewhere")] {
            store
                .add_component(PageComponent {
                    id,
                    page_id,
                    name: name.to_string(),
                })
                .await;
        }
        let service = SubscriptionService::new(Arc::new(store.clone()), Arc::new(store.clone()));
        (store, service)
    }

    fn set(ids: &[i64]) -> BTreeSet<i64> {
        ids.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_new_subscription_is_pending_with_seven_day_deadline() {
        let (_, service) = setup().await;
        let sub = service
            .upsert_email_subscription("Jane@Acme.com", 1, &[10])
            .await
            .unwrap();

        assert_eq!(sub.email(), Some("jane@acme.com"));
        assert_eq!(sub.state(), SubscriptionState::Pending);
        assert_eq!(sub.component_ids, set(&[10]));
        assert_eq!(sub.workspace_id, Some(9));
        let ttl = sub.expires_at - Utc::now();
        assert!(ttl > Duration::days(6) && ttl <= Duration::days(7));
    }

    #[tokio::test]
    async fn test_upsert_rejects_foreign_components() {
        let (store, service) = setup().await;
        let err = service
            .upsert_email_subscription("jane@acme.com", 1, &[10, 20, 99])
            .await
            .unwrap_err();

        match err {
            SubscriptionError::InvalidScope { component_ids } => {
                assert_eq!(component_ids, vec![20, 99])
            }
            other => panic!("expected InvalidScope, got {other:?}"),
        }
        assert!(store.all().await.is_empty(), "nothing should be written");
    }

    #[tokio::test]
    async fn test_upsert_rejects_bad_email_and_unknown_page() {
        let (_, service) = setup().await;
        assert!(matches!(
            service.upsert_email_subscription("nope", 1, &[]).await,
            Err(SubscriptionError::InvalidEmail)
        ));
        assert!(matches!(
            service.upsert_email_subscription("a@x.com", 404, &[]).await,
            Err(SubscriptionError::PageNotFound)
        ));
    }

    #[tokio::test]
    async fn test_resubscribe_while_active_merges_scope() {
        let (store, service) = setup().await;
        let first = service
            .upsert_email_subscription("jane@acme.com", 1, &[10])
            .await
            .unwrap();
        service.verify_subscription(&first.token, None).await.unwrap();

        let second = service
            .upsert_email_subscription("jane@acme.com", 1, &[11])
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.token, first.token, "token untouched on merge");
        assert!(second.verified_at.is_some(), "verification untouched on merge");
        assert_eq!(second.component_ids, set(&[10, 11]));
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_whole_page_with_component_narrows_to_union() {
        // literal set union: {} ∪ {10} = {10}
        let (_, service) = setup().await;
        service
            .upsert_email_subscription("jane@acme.com", 1, &[])
            .await
            .unwrap();
        let merged = service
            .upsert_email_subscription("jane@acme.com", 1, &[10])
            .await
            .unwrap();
        assert_eq!(merged.component_ids, set(&[10]));

        let again = service
            .upsert_email_subscription("jane@acme.com", 1, &[])
            .await
            .unwrap();
        assert_eq!(again.component_ids, set(&[10]), "{{10}} ∪ {{}} = {{10}}");
    }

    #[tokio::test]
    async fn test_resubscribe_while_pending_extends_deadline() {
        let (store, service) = setup().await;
        let first = service
            .upsert_email_subscription("jane@acme.com", 1, &[])
            .await
            .unwrap();

        let mut stale = store.get(first.id).await.unwrap();
        stale.expires_at = Utc::now() + Duration::hours(1);
        store.put(stale).await;

        let second = service
            .upsert_email_subscription("jane@acme.com", 1, &[])
            .await
            .unwrap();
        assert_eq!(second.token, first.token);
        assert!(second.expires_at > Utc::now() + Duration::days(6));
    }

    #[tokio::test]
    async fn test_resubscribe_after_unsubscribe_reactivates_with_new_token() {
        let (_, service) = setup().await;
        let first = service
            .upsert_email_subscription("jane@acme.com", 1, &[10, 11])
            .await
            .unwrap();
        service.verify_subscription(&first.token, None).await.unwrap();
        service.unsubscribe(&first.token, None).await.unwrap();

        let again = service
            .upsert_email_subscription("jane@acme.com", 1, &[11])
            .await
            .unwrap();

        assert_eq!(again.id, first.id);
        assert_ne!(again.token, first.token);
        assert!(again.verified_at.is_none());
        assert!(again.unsubscribed_at.is_none());
        assert_eq!(again.component_ids, set(&[11]), "scope replaced, not merged");
        assert_eq!(again.state(), SubscriptionState::Pending);

        // the old capability is dead
        assert!(service
            .verify_subscription(&first.token, None)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_verify_is_idempotent() {
        let (_, service) = setup().await;
        let sub = service
            .upsert_email_subscription("jane@acme.com", 1, &[])
            .await
            .unwrap();

        let first = service
            .verify_subscription(&sub.token, None)
            .await
            .unwrap()
            .unwrap();
        let second = service
            .verify_subscription(&sub.token, None)
            .await
            .unwrap()
            .unwrap();

        assert!(first.verified_at.is_some());
        assert_eq!(first.verified_at, second.verified_at);
    }

    #[tokio::test]
    async fn test_verify_unknown_token_is_none() {
        let (_, service) = setup().await;
        assert!(service
            .verify_subscription("missing", None)
            .await
            .unwrap()
            .is_none());
        assert!(service.verify_subscription("", None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_verify_expired_token_fails() {
        let (store, service) = setup().await;
        let sub = service
            .upsert_email_subscription("jane@acme.com", 1, &[])
            .await
            .unwrap();
        let mut expired = store.get(sub.id).await.unwrap();
        expired.expires_at = Utc::now() - Duration::minutes(1);
        store.put(expired).await;

        assert!(matches!(
            service.verify_subscription(&sub.token, None).await,
            Err(SubscriptionError::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn test_verify_after_expiry_is_fine_once_verified() {
        let (store, service) = setup().await;
        let sub = service
            .upsert_email_subscription("jane@acme.com", 1, &[])
            .await
            .unwrap();
        service.verify_subscription(&sub.token, None).await.unwrap();
        let mut old = store.get(sub.id).await.unwrap();
        old.expires_at = Utc::now() - Duration::days(30);
        store.put(old).await;

        assert!(service
            .verify_subscription(&sub.token, None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_domain_must_match_page() {
        let (_, service) = setup().await;
        let sub = service
            .upsert_email_subscription("jane@acme.com", 1, &[])
            .await
            .unwrap();

        assert!(service
            .verify_subscription(&sub.token, Some("other"))
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            service.unsubscribe(&sub.token, Some("other")).await,
            Err(SubscriptionError::NotFound)
        ));
        assert!(service
            .verify_subscription(&sub.token, Some("STATUS.ACME.COM"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_update_scope_replaces() {
        let (_, service) = setup().await;
        let sub = service
            .upsert_email_subscription("jane@acme.com", 1, &[10])
            .await
            .unwrap();

        let updated = service
            .update_subscription_scope(&sub.token, &[11], Some("acme"))
            .await
            .unwrap();
        assert_eq!(updated.component_ids, set(&[11]));

        let cleared = service
            .update_subscription_scope(&sub.token, &[], None)
            .await
            .unwrap();
        assert!(cleared.component_ids.is_empty());
    }

    #[tokio::test]
    async fn test_update_scope_errors() {
        let (_, service) = setup().await;
        let sub = service
            .upsert_email_subscription("jane@acme.com", 1, &[10])
            .await
            .unwrap();

        assert!(matches!(
            service.update_subscription_scope("missing", &[10], None).await,
            Err(SubscriptionError::NotFound)
        ));
        assert!(matches!(
            service
                .update_subscription_scope(&sub.token, &[10], Some("other"))
                .await,
            Err(SubscriptionError::NotFound)
        ));
        assert!(matches!(
            service.update_subscription_scope(&sub.token, &[20], None).await,
            Err(SubscriptionError::InvalidScope { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_fails() {
        let (store, service) = setup().await;
        let sub = service
            .upsert_email_subscription("jane@acme.com", 1, &[])
            .await
            .unwrap();

        service.unsubscribe(&sub.token, Some("acme")).await.unwrap();
        assert!(store.get(sub.id).await.unwrap().unsubscribed_at.is_some());
        assert!(matches!(
            service.unsubscribe(&sub.token, None).await,
            Err(SubscriptionError::AlreadyUnsubscribed)
        ));
        assert!(matches!(
            service.unsubscribe("missing", None).await,
            Err(SubscriptionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_get_by_token_masks_email() {
        let (_, service) = setup().await;
        let sub = service
            .upsert_email_subscription("jane.doe@acme.com", 1, &[10])
            .await
            .unwrap();

        let summary = service
            .get_subscription_by_token(&sub.token, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.email.as_deref(), Some("j***@acme.com"));
        assert_eq!(summary.page_title.as_deref(), Some("Acme Status"));
        assert_eq!(summary.component_ids, vec![10]);

        let json = serde_json::to_string(&summary).unwrap();
        assert!(!json.contains("jane.doe"));
        assert!(!json.contains(&sub.token));

        assert!(service
            .get_subscription_by_token(&sub.token, Some("other"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_create_webhook_subscription_is_verified() {
        let (_, service) = setup().await;
        let config = WebhookConfig {
            headers: vec![WebhookHeader {
                key: "Authorization".to_string(),
                value: "Bearer xyz".to_string(),
            }],
            secret: Some("s3cret".to_string()),
        };
        let sub = service
            .create_webhook_subscription(1, "https://hooks.acme.com/status", config.clone(), &[11])
            .await
            .unwrap();

        assert!(sub.is_eligible());
        assert_eq!(
            sub.webhook(),
            Some(("https://hooks.acme.com/status", &config))
        );
        assert_eq!(sub.component_ids, set(&[11]));
    }

    #[tokio::test]
    async fn test_create_webhook_subscription_validates_target() {
        let (_, service) = setup().await;
        let service = service.with_production(true);

        assert!(matches!(
            service
                .create_webhook_subscription(
                    1,
                    "http://localhost/hook",
                    WebhookConfig::default(),
                    &[],
                )
                .await,
            Err(SubscriptionError::InvalidChannelConfig(_))
        ));
        let reserved = WebhookConfig {
            headers: vec![WebhookHeader {
                key: "User-Agent".to_string(),
                value: "mine".to_string(),
            }],
            secret: None,
        };
        assert!(matches!(
            service
                .create_webhook_subscription(1, "https://hooks.acme.com", reserved, &[])
                .await,
            Err(SubscriptionError::InvalidChannelConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_list_page_subscriptions_is_masked() {
        let (_, service) = setup().await;
        service
            .upsert_email_subscription("jane@acme.com", 1, &[])
            .await
            .unwrap();
        service
            .upsert_email_subscription("bob@acme.com", 2, &[])
            .await
            .unwrap();

        let listed = service.list_page_subscriptions(1).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].email.as_deref(), Some("j***@acme.com"));
    }

    #[tokio::test]
    async fn test_concurrent_first_subscriptions_collapse_to_one_row() {
        let (store, service) = setup().await;
        let service = Arc::new(service);

        let a = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .upsert_email_subscription("jane@acme.com", 1, &[10])
                    .await
            })
        };
        let b = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .upsert_email_subscription("jane@acme.com", 1, &[11])
                    .await
            })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a.id, b.id);
        let rows = store.all().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].component_ids, set(&[10, 11]));
    }
    const HOOK_URL: &str = "https://hooks.acme.com/x";

    #[tokio::test]
    async fn test_create_webhook_twice_keeps_one_row() {
        let (store, service) = setup().await;
        let first = service
            .create_webhook_subscription(1, HOOK_URL, WebhookConfig::default(), &[10])
            .await
            .unwrap();
        let rotated = WebhookConfig {
            headers: vec![],
            secret: Some("rotated".to_string()),
        };
        let second = service
            .create_webhook_subscription(1, HOOK_URL, rotated.clone(), &[11])
            .await
            .unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.token, first.token);
        assert_eq!(second.component_ids, set(&[10, 11]));
        assert_eq!(second.webhook().unwrap().1, &rotated);
        assert_eq!(store.list_eligible_for_page(1).await.unwrap().len(), 1);

        // the same target on another page is a separate subscription
        let other = service
            .create_webhook_subscription(2, HOOK_URL, WebhookConfig::default(), &[])
            .await
            .unwrap();
        assert_ne!(other.id, first.id);
    }

    #[tokio::test]
    async fn test_create_webhook_after_unsubscribe_reactivates() {
        let (store, service) = setup().await;
        let first = service
            .create_webhook_subscription(1, HOOK_URL, WebhookConfig::default(), &[10])
            .await
            .unwrap();
        service.unsubscribe(&first.token, None).await.unwrap();

        let again = service
            .create_webhook_subscription(1, HOOK_URL, WebhookConfig::default(), &[11])
            .await
            .unwrap();

        assert_eq!(again.id, first.id);
        assert_ne!(again.token, first.token);
        assert_eq!(again.state(), SubscriptionState::Active);
        assert_eq!(again.component_ids, set(&[11]));
        assert_eq!(store.list_eligible_for_page(1).await.unwrap().len(), 1);
    }

    /// Store whose next `stale_reads` transactions miss the existing row on
    /// lookup, as a transaction that started before a competing commit would.
    struct StaleReadStore {
        inner: MemoryStore,
        stale_reads: AtomicUsize,
        begins: AtomicUsize,
    }

    struct StaleReadTransaction {
        inner: Box<dyn StoreTransaction>,
        stale: bool,
    }

    #[async_trait]
    impl SubscriptionStore for StaleReadStore {
        async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            let stale = self
                .stale_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            Ok(Box::new(StaleReadTransaction {
                inner: self.inner.begin().await?,
                stale,
            }))
        }

        async fn find_by_token(&self, token: &str) -> Result<Option<Subscription>, StoreError> {
            self.inner.find_by_token(token).await
        }

        async fn list_eligible_for_page(
            &self,
            page_id: i64,
        ) -> Result<Vec<Subscription>, StoreError> {
            self.inner.list_eligible_for_page(page_id).await
        }

        async fn list_for_page(&self, page_id: i64) -> Result<Vec<Subscription>, StoreError> {
            self.inner.list_for_page(page_id).await
        }

        async fn mark_verified(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
            self.inner.mark_verified(id, at).await
        }

        async fn mark_unsubscribed(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
            self.inner.mark_unsubscribed(id, at).await
        }
    }

    #[async_trait]
    impl StoreTransaction for StaleReadTransaction {
        async fn lock_email_subscription(
            &mut self,
            page_id: i64,
            email: &str,
        ) -> Result<Option<Subscription>, StoreError> {
            if self.stale {
                return Ok(None);
            }
            self.inner.lock_email_subscription(page_id, email).await
        }

        async fn lock_webhook_subscription(
            &mut self,
            page_id: i64,
            url: &str,
        ) -> Result<Option<Subscription>, StoreError> {
            if self.stale {
                return Ok(None);
            }
            self.inner.lock_webhook_subscription(page_id, url).await
        }

        async fn insert(&mut self, new: NewSubscription) -> Result<i64, StoreError> {
            self.inner.insert(new).await
        }

        async fn reactivate(
            &mut self,
            id: i64,
            token: &str,
            expires_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.reactivate(id, token, expires_at).await
        }

        async fn refresh_webhook(
            &mut self,
            id: i64,
            config: &WebhookConfig,
            at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.refresh_webhook(id, config, at).await
        }

        async fn extend_expiry(
            &mut self,
            id: i64,
            expires_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.inner.extend_expiry(id, expires_at).await
        }

        async fn replace_scope(
            &mut self,
            id: i64,
            component_ids: &BTreeSet<i64>,
        ) -> Result<(), StoreError> {
            self.inner.replace_scope(id, component_ids).await
        }

        async fn get(&mut self, id: i64) -> Result<Option<Subscription>, StoreError> {
            self.inner.get(id).await
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.inner.commit().await
        }
    }

    async fn stale_read_service(
        stale_reads: usize,
    ) -> (Arc<StaleReadStore>, SubscriptionService) {
        let (store, service) = setup().await;
        // the competing first subscription has already committed
        service
            .upsert_email_subscription("jane@acme.com", 1, &[10])
            .await
            .unwrap();
        let racing = Arc::new(StaleReadStore {
            inner: store.clone(),
            stale_reads: AtomicUsize::new(stale_reads),
            begins: AtomicUsize::new(0),
        });
        let service = SubscriptionService::new(racing.clone(), Arc::new(store));
        (racing, service)
    }

    #[tokio::test]
    async fn test_insert_conflict_retries_into_merge() {
        let (racing, service) = stale_read_service(1).await;

        let merged = service
            .upsert_email_subscription("jane@acme.com", 1, &[11])
            .await
            .unwrap();

        assert_eq!(racing.begins.load(Ordering::SeqCst), 2);
        assert_eq!(merged.component_ids, set(&[10, 11]));
        let rows = racing.inner.all().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, merged.id);
        assert_eq!(rows[0].component_ids, set(&[10, 11]));
    }

    #[tokio::test]
    async fn test_second_insert_conflict_is_returned() {
        let (racing, service) = stale_read_service(2).await;

        let err = service
            .upsert_email_subscription("jane@acme.com", 1, &[11])
            .await
            .unwrap_err();

        assert!(matches!(err, SubscriptionError::Store(StoreError::Conflict)));
        assert_eq!(racing.begins.load(Ordering::SeqCst), 2, "retried only once");
        let rows = racing.inner.all().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].component_ids, set(&[10]), "failed attempts leave no trace");
    }
}
