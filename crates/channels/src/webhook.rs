use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use statuscast_core::config::Settings;
use statuscast_core::signing::{sign_payload, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use statuscast_core::types::{
    ChannelType, Page, PageUpdate, Subscription, UpdateStatus, WebhookConfig,
};
use statuscast_core::webhook::{self, USER_AGENT as WEBHOOK_USER_AGENT};
use tracing::{debug, info, warn};

use crate::{Channel, ChannelError, DeliveryReport};

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    page: PagePayload<'a>,
    update: UpdatePayload<'a>,
}

#[derive(Debug, Serialize)]
struct PagePayload<'a> {
    id: i64,
    name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdatePayload<'a> {
    id: i64,
    title: &'a str,
    status: UpdateStatus,
    message: &'a str,
    page_components: &'a [String],
    date: DateTime<Utc>,
}

impl<'a> WebhookPayload<'a> {
    fn new(page: &'a Page, update: &'a PageUpdate) -> Self {
        Self {
            kind: "page_update",
            page: PagePayload {
                id: page.id,
                name: &page.title,
            },
            update: UpdatePayload {
                id: update.id,
                title: &update.title,
                status: update.status,
                message: &update.message,
                page_components: &update.page_components,
                date: update.date,
            },
        }
    }
}

/// Config document accepted by [`WebhookChannel::validate_config`].
#[derive(Debug, Deserialize)]
struct WebhookTarget {
    url: String,
    #[serde(flatten)]
    config: WebhookConfig,
}

/// One POST per subscriber, all in parallel, each bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    client: reqwest::Client,
    timeout: Duration,
    production: bool,
}

impl WebhookChannel {
    pub fn new(client: reqwest::Client, timeout: Duration, production: bool) -> Self {
        Self {
            client,
            timeout,
            production,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            reqwest::Client::new(),
            Duration::from_secs(settings.webhook_timeout_secs),
            settings.is_production(),
        )
    }

    fn build_headers(config: &WebhookConfig, timestamp: i64, body: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for header in &config.headers {
            if let (Ok(name), Ok(value)) = (
                header.key.parse::<HeaderName>(),
                header.value.parse::<HeaderValue>(),
            ) {
                headers.insert(name, value);
            }
        }

        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(USER_AGENT, HeaderValue::from_static(WEBHOOK_USER_AGENT));

        if let Some(secret) = config.secret.as_deref() {
            let signature = sign_payload(secret, timestamp, body);
            if let Ok(value) = signature.parse() {
                headers.insert(HeaderName::from_static("x-openstatus-signature"), value);
            }
            headers.insert(
                HeaderName::from_static("x-openstatus-timestamp"),
                HeaderValue::from(timestamp),
            );
        }

        headers
    }

    async fn post(&self, url: &str, config: &WebhookConfig, body: &str) -> Result<(), String> {
        let headers = Self::build_headers(config, Utc::now().timestamp(), body);

        let response = self
            .client
            .post(url)
            .headers(headers)
            .timeout(self.timeout)
            .body(body.to_string())
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    format!("timed out after {:?}", self.timeout)
                } else {
                    err.to_string()
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("endpoint returned {}", status.as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Webhook
    }

    fn validate_config(&self, config: &serde_json::Value) -> Result<(), ChannelError> {
        let target: WebhookTarget = serde_json::from_value(config.clone())
            .map_err(|err| ChannelError::InvalidConfig(err.to_string()))?;
        webhook::validate_url(&target.url, self.production).map_err(ChannelError::InvalidConfig)?;
        webhook::validate_config(&target.config).map_err(ChannelError::InvalidConfig)
    }

    async fn send_verification(
        &self,
        subscription: &Subscription,
        _page: &Page,
        _verify_url: &str,
    ) -> Result<(), ChannelError> {
        if subscription.webhook().is_none() {
            return Err(ChannelError::MissingField {
                subscription_id: subscription.id,
                field: "webhook_url",
            });
        }
        // owner-created webhooks are verified on creation
        debug!(subscription_id = subscription.id, "webhook needs no verification message");
        Ok(())
    }

    async fn send_notifications(
        &self,
        subscriptions: &[Subscription],
        page: &Page,
        update: &PageUpdate,
    ) -> Result<DeliveryReport, ChannelError> {
        let targets: Vec<(i64, &str, &WebhookConfig)> = subscriptions
            .iter()
            .filter_map(|sub| sub.webhook().map(|(url, config)| (sub.id, url, config)))
            .collect();

        if targets.is_empty() {
            return Ok(DeliveryReport::default());
        }

        let body = serde_json::to_string(&WebhookPayload::new(page, update))?;
        let body = body.as_str();

        let results = join_all(targets.iter().map(|&(id, url, config)| async move {
            (id, self.post(url, config, body).await)
        }))
        .await;

        let mut report = DeliveryReport::default();
        for (subscription_id, result) in results {
            match result {
                Ok(()) => report.sent += 1,
                Err(error) => {
                    report.failed += 1;
                    warn!(subscription_id, page_id = page.id, %error, "webhook delivery failed");
                }
            }
        }

        info!(
            page_id = page.id,
            update_id = update.id,
            sent = report.sent,
            failed = report.failed,
            "webhook notifications sent"
        );
        Ok(report)
    }
}
