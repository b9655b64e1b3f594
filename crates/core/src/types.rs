use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::email::mask_email;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Email,
    Webhook,
}

impl ChannelType {
    pub const ALL: [ChannelType; 2] = [ChannelType::Email, ChannelType::Webhook];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Email => "email",
            ChannelType::Webhook => "webhook",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for ChannelType {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "email" => Ok(ChannelType::Email),
            "webhook" => Ok(ChannelType::Webhook),
            other => Err(UnknownVariant {
                kind: "channel type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Investigating,
    Identified,
    Monitoring,
    Resolved,
    Maintenance,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Investigating => "investigating",
            UpdateStatus::Identified => "identified",
            UpdateStatus::Monitoring => "monitoring",
            UpdateStatus::Resolved => "resolved",
            UpdateStatus::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "investigating" => Ok(UpdateStatus::Investigating),
            "identified" => Ok(UpdateStatus::Identified),
            "monitoring" => Ok(UpdateStatus::Monitoring),
            "resolved" => Ok(UpdateStatus::Resolved),
            "maintenance" => Ok(UpdateStatus::Maintenance),
            other => Err(UnknownVariant {
                kind: "update status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookHeader {
    pub key: String,
    pub value: String,
}

/// Stored in `channel_config` for webhook subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default)]
    pub headers: Vec<WebhookHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

/// Who receives notifications for a subscription, and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelIdentity {
    Email { email: String },
    Webhook { url: String, config: WebhookConfig },
}

impl ChannelIdentity {
    pub fn channel_type(&self) -> ChannelType {
        match self {
            ChannelIdentity::Email { .. } => ChannelType::Email,
            ChannelIdentity::Webhook { .. } => ChannelType::Webhook,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Pending,
    Active,
    Unsubscribed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: i64,
    pub page_id: i64,
    pub workspace_id: Option<i64>,
    pub identity: ChannelIdentity,
    /// Bearer credential: anyone holding it can verify, rescope and
    /// unsubscribe. Generated by [`crate::token::generate_token`].
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    /// Empty means the entire page.
    pub component_ids: BTreeSet<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn channel_type(&self) -> ChannelType {
        self.identity.channel_type()
    }

    pub fn email(&self) -> Option<&str> {
        match &self.identity {
            ChannelIdentity::Email { email } => Some(email),
            ChannelIdentity::Webhook { .. } => None,
        }
    }

    pub fn webhook(&self) -> Option<(&str, &WebhookConfig)> {
        match &self.identity {
            ChannelIdentity::Webhook { url, config } => Some((url, config)),
            ChannelIdentity::Email { .. } => None,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        if self.unsubscribed_at.is_some() {
            SubscriptionState::Unsubscribed
        } else if self.verified_at.is_some() {
            SubscriptionState::Active
        } else {
            SubscriptionState::Pending
        }
    }

    /// The only predicate dispatch applies before scope filtering.
    pub fn is_eligible(&self) -> bool {
        self.verified_at.is_some() && self.unsubscribed_at.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.verified_at.is_none() && self.expires_at < now
    }

    pub fn summary(&self, page: Option<&Page>) -> SubscriptionSummary {
        let (email, webhook_url) = match &self.identity {
            ChannelIdentity::Email { email } => (Some(mask_email(email)), None),
            ChannelIdentity::Webhook { url, .. } => (None, Some(url.clone())),
        };
        SubscriptionSummary {
            id: self.id,
            page_id: self.page_id,
            page_title: page.map(|page| page.title.clone()),
            page_slug: page.map(|page| page.slug.clone()),
            channel_type: self.channel_type(),
            state: self.state(),
            email,
            webhook_url,
            component_ids: self.component_ids.iter().copied().collect(),
            expires_at: self.expires_at,
            verified_at: self.verified_at,
            unsubscribed_at: self.unsubscribed_at,
        }
    }
}

/// Read model for management surfaces. `email` is always masked.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    pub id: i64,
    pub page_id: i64,
    pub page_title: Option<String>,
    pub page_slug: Option<String>,
    pub channel_type: ChannelType,
    pub state: SubscriptionState,
    pub email: Option<String>,
    pub webhook_url: Option<String>,
    pub component_ids: Vec<i64>,
    pub expires_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub page_id: i64,
    pub workspace_id: Option<i64>,
    pub identity: ChannelIdentity,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub component_ids: BTreeSet<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub id: i64,
    pub workspace_id: Option<i64>,
    pub title: String,
    pub slug: String,
    pub custom_domain: Option<String>,
}

impl Page {
    /// Case-insensitive match against the slug or the custom domain.
    pub fn matches_domain(&self, domain: &str) -> bool {
        let domain = domain.trim();
        if domain.eq_ignore_ascii_case(&self.slug) {
            return true;
        }
        self.custom_domain
            .as_deref()
            .map(|custom| !custom.is_empty() && custom.eq_ignore_ascii_case(domain))
            .unwrap_or(false)
    }

    pub fn host(&self, base_domain: &str) -> String {
        match self.custom_domain.as_deref() {
            Some(custom) if !custom.is_empty() => custom.to_string(),
            _ => format!("{}.{}", self.slug, base_domain),
        }
    }

    pub fn verify_url(&self, base_domain: &str, token: &str) -> String {
        format!("https://{}/verify/{}", self.host(base_domain), token)
    }

    pub fn manage_url(&self, base_domain: &str, token: &str) -> String {
        format!("https://{}/manage/{}", self.host(base_domain), token)
    }

    pub fn unsubscribe_url(&self, base_domain: &str, token: &str) -> String {
        format!("https://{}/unsubscribe/{}", self.host(base_domain), token)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageComponent {
    pub id: i64,
    pub page_id: i64,
    pub name: String,
}

/// One notifiable change on a page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PageUpdate {
    pub id: i64,
    pub page_id: i64,
    pub title: String,
    pub status: UpdateStatus,
    pub message: String,
    pub page_component_ids: Vec<i64>,
    pub page_components: Vec<String>,
    pub date: DateTime<Utc>,
}
