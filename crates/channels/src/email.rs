use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use statuscast_core::email::normalize_email;
use statuscast_core::types::{ChannelType, Page, PageUpdate, Subscription};
use tracing::{debug, info};

use crate::email_client::{BatchedUpdate, EmailClient, Recipient};
use crate::{Channel, ChannelError, DeliveryReport};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EmailChannelConfig {
    email: String,
}

/// Email delivery through an [`EmailClient`]. One client call per update,
/// the client does the chunking.
#[derive(Clone)]
pub struct EmailChannel {
    client: Arc<dyn EmailClient>,
}

impl EmailChannel {
    pub fn new(client: Arc<dyn EmailClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    fn validate_config(&self, config: &serde_json::Value) -> Result<(), ChannelError> {
        let config: EmailChannelConfig = serde_json::from_value(config.clone())
            .map_err(|err| ChannelError::InvalidConfig(err.to_string()))?;
        normalize_email(&config.email)
            .map(|_| ())
            .map_err(|err| ChannelError::InvalidConfig(err.to_string()))
    }

    async fn send_verification(
        &self,
        subscription: &Subscription,
        page: &Page,
        verify_url: &str,
    ) -> Result<(), ChannelError> {
        let email = subscription.email().ok_or(ChannelError::MissingField {
            subscription_id: subscription.id,
            field: "email",
        })?;

        self.client
            .send_verification_email(email, verify_url, &page.title)
            .await?;
        debug!(subscription_id = subscription.id, page_id = page.id, "verification email sent");
        Ok(())
    }

    async fn send_notifications(
        &self,
        subscriptions: &[Subscription],
        page: &Page,
        update: &PageUpdate,
    ) -> Result<DeliveryReport, ChannelError> {
        let recipients: Vec<Recipient> = subscriptions
            .iter()
            .filter_map(|sub| {
                sub.email().map(|email| Recipient {
                    email: email.to_string(),
                    token: sub.token.clone(),
                })
            })
            .collect();

        if recipients.is_empty() {
            return Ok(DeliveryReport::default());
        }

        let sent = recipients.len();
        let batch = BatchedUpdate {
            recipients,
            page: page.clone(),
            report_title: update.title.clone(),
            status: update.status,
            message: update.message.clone(),
            date: update.date,
            components: update.page_components.clone(),
        };
        self.client.send_batched_update(&batch).await?;

        info!(
            page_id = page.id,
            update_id = update.id,
            recipients = sent,
            "email notifications sent"
        );
        Ok(DeliveryReport { sent, failed: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email_client::EmailClientError;
    use crate::fixtures;
    use serde_json::json;
    use statuscast_core::types::WebhookConfig;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        verifications: Mutex<Vec<(String, String, String)>>,
        batches: Mutex<Vec<BatchedUpdate>>,
        fail: bool,
    }

    #[async_trait]
    impl EmailClient for RecordingClient {
        async fn send_verification_email(
            &self,
            to: &str,
            link: &str,
            page_name: &str,
        ) -> Result<(), EmailClientError> {
            self.verifications
                .lock()
                .await
                .push((to.to_string(), link.to_string(), page_name.to_string()));
            Ok(())
        }

        async fn send_batched_update(
            &self,
            update: &BatchedUpdate,
        ) -> Result<(), EmailClientError> {
            if self.fail {
                return Err(EmailClientError::Status {
                    status: 500,
                    body: "down".to_string(),
                });
            }
            self.batches.lock().await.push(update.clone());
            Ok(())
        }
    }

    #[test]
    fn test_validate_config() {
        let channel = EmailChannel::new(Arc::new(RecordingClient::default()));

        assert!(channel.validate_config(&json!({"email": "jane@acme.dev"})).is_ok());
        assert!(channel.validate_config(&json!({"email": "nope"})).is_err());
        assert!(channel.validate_config(&json!({})).is_err());
        assert!(channel
            .validate_config(&json!({"email": "jane@acme.dev", "extra": 1}))
            .is_err());
    }

    #[tokio::test]
    async fn test_send_verification_uses_page_title() {
        let client = Arc::new(RecordingClient::default());
        let channel = EmailChannel::new(client.clone());
        let sub = fixtures::email_subscription(1, "jane@acme.dev");

        channel
            .send_verification(&sub, &fixtures::page(), "https://acme.openstatus.dev/verify/x")
            .await
            .unwrap();

        let sent = client.verifications.lock().await;
        assert_eq!(
            sent[0],
            (
                "jane@acme.dev".to_string(),
                "https://acme.openstatus.dev/verify/x".to_string(),
                "Acme Status".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_send_verification_requires_email() {
        let channel = EmailChannel::new(Arc::new(RecordingClient::default()));
        let sub =
            fixtures::webhook_subscription(3, "https://hooks.acme.dev", WebhookConfig::default());

        let err = channel
            .send_verification(&sub, &fixtures::page(), "https://x/verify/y")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ChannelError::MissingField { subscription_id: 3, field: "email" }
        ));
    }

    #[tokio::test]
    async fn test_notifications_go_out_as_one_batch() {
        let client = Arc::new(RecordingClient::default());
        let channel = EmailChannel::new(client.clone());
        let subs = vec![
            fixtures::email_subscription(1, "a@acme.dev"),
            fixtures::webhook_subscription(2, "https://hooks.acme.dev", WebhookConfig::default()),
            fixtures::email_subscription(3, "b@acme.dev"),
        ];

        let report = channel
            .send_notifications(&subs, &fixtures::page(), &fixtures::update())
            .await
            .unwrap();

        assert_eq!(report, DeliveryReport { sent: 2, failed: 0 });
        let batches = client.batches.lock().await;
        assert_eq!(batches.len(), 1);
        assert_eq!(
            batches[0].recipients,
            vec![
                Recipient {
                    email: "a@acme.dev".to_string(),
                    token: "token-1".to_string()
                },
                Recipient {
                    email: "b@acme.dev".to_string(),
                    token: "token-3".to_string()
                },
            ]
        );
        assert_eq!(batches[0].components, vec!["API".to_string()]);
    }

    #[tokio::test]
    async fn test_no_recipients_skips_client() {
        let client = Arc::new(RecordingClient::default());
        let channel = EmailChannel::new(client.clone());

        let report = channel
            .send_notifications(&[], &fixtures::page(), &fixtures::update())
            .await
            .unwrap();

        assert_eq!(report, DeliveryReport::default());
        assert!(client.batches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_client_failure_propagates() {
        let client = Arc::new(RecordingClient {
            fail: true,
            ..Default::default()
        });
        let channel = EmailChannel::new(client);
        let subs = vec![fixtures::email_subscription(1, "a@acme.dev")];

        let err = channel
            .send_notifications(&subs, &fixtures::page(), &fixtures::update())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Email(_)));
    }
}
