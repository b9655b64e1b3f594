//! Row types and the mapping between rows and domain types.
//!
//! `page_subscription` keeps the channel identity in two nullable columns.
//! This module is the only place that looks at which one is populated.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use statuscast_core::error::StoreError;
use statuscast_core::types::{
    ChannelIdentity, ChannelType, Page, PageComponent, PageUpdate, Subscription, UpdateStatus,
    WebhookConfig,
};

#[derive(Debug, Clone, FromRow)]
pub struct SubscriptionRow {
    pub id: i64,
    pub page_id: i64,
    pub workspace_id: Option<i64>,
    pub channel_type: String,
    pub email: Option<String>,
    pub webhook_url: Option<String>,
    pub channel_config: Option<serde_json::Value>,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub component_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StoreError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let channel_type: ChannelType = row
            .channel_type
            .parse()
            .map_err(|err| StoreError::Integrity(format!("subscription {}: {}", row.id, err)))?;

        let identity = match (channel_type, row.email, row.webhook_url) {
            (ChannelType::Email, Some(email), None) => ChannelIdentity::Email { email },
            (ChannelType::Webhook, None, Some(url)) => {
                let config = match row.channel_config {
                    Some(value) if !value.is_null() => {
                        serde_json::from_value::<WebhookConfig>(value).map_err(|err| {
                            StoreError::Integrity(format!(
                                "subscription {}: channel_config: {}",
                                row.id, err
                            ))
                        })?
                    }
                    _ => WebhookConfig::default(),
                };
                ChannelIdentity::Webhook { url, config }
            }
            (channel_type, email, url) => {
                return Err(StoreError::Integrity(format!(
                    "subscription {}: {} row with email set: {}, webhook_url set: {}",
                    row.id,
                    channel_type,
                    email.is_some(),
                    url.is_some()
                )))
            }
        };

        Ok(Subscription {
            id: row.id,
            page_id: row.page_id,
            workspace_id: row.workspace_id,
            identity,
            token: row.token,
            expires_at: row.expires_at,
            verified_at: row.verified_at,
            unsubscribed_at: row.unsubscribed_at,
            component_ids: row.component_ids.into_iter().collect::<BTreeSet<_>>(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Column values for an identity: `(channel_type, email, webhook_url, channel_config)`.
pub fn identity_columns(
    identity: &ChannelIdentity,
) -> Result<(ChannelType, Option<&str>, Option<&str>, Option<serde_json::Value>), StoreError> {
    match identity {
        ChannelIdentity::Email { email } => {
            Ok((ChannelType::Email, Some(email.as_str()), None, None))
        }
        ChannelIdentity::Webhook { url, config } => {
            let config = serde_json::to_value(config).map_err(StoreError::backend)?;
            Ok((ChannelType::Webhook, None, Some(url.as_str()), Some(config)))
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PageRow {
    pub id: i64,
    pub workspace_id: Option<i64>,
    pub title: String,
    pub slug: String,
    pub custom_domain: Option<String>,
}

impl From<PageRow> for Page {
    fn from(row: PageRow) -> Self {
        Page {
            id: row.id,
            workspace_id: row.workspace_id,
            title: row.title,
            slug: row.slug,
            custom_domain: row.custom_domain.filter(|domain| !domain.is_empty()),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ComponentRow {
    pub id: i64,
    pub page_id: i64,
    pub name: String,
}

impl From<ComponentRow> for PageComponent {
    fn from(row: ComponentRow) -> Self {
        PageComponent {
            id: row.id,
            page_id: row.page_id,
            name: row.name,
        }
    }
}

/// A status report update or maintenance joined with its components.
#[derive(Debug, Clone, FromRow)]
pub struct UpdateRow {
    pub id: i64,
    pub page_id: Option<i64>,
    pub title: String,
    pub status: String,
    pub message: String,
    pub date: DateTime<Utc>,
    pub component_ids: Vec<i64>,
    pub component_names: Vec<String>,
}

impl TryFrom<UpdateRow> for PageUpdate {
    type Error = StoreError;

    fn try_from(row: UpdateRow) -> Result<Self, Self::Error> {
        let page_id = row
            .page_id
            .ok_or_else(|| StoreError::Integrity(format!("update {} has no page", row.id)))?;
        let status: UpdateStatus = row
            .status
            .parse()
            .map_err(|err| StoreError::Integrity(format!("update {}: {}", row.id, err)))?;

        Ok(PageUpdate {
            id: row.id,
            page_id,
            title: row.title,
            status,
            message: row.message,
            page_component_ids: row.component_ids,
            page_components: row.component_names,
            date: row.date,
        })
    }
}
