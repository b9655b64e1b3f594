//! Client for a Resend-compatible transactional email API.
//!
//! Verification mails go to `POST /emails`, update notifications to
//! `POST /emails/batch` in chunks of `batch_size`. Network errors, 429 and
//! 5xx are retried with exponential backoff; other 4xx answers fail at once.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use serde::Serialize;
use statuscast_core::config::Settings;
use statuscast_core::types::{Page, UpdateStatus};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum EmailClientError {
    #[error("email api request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("email api returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl EmailClientError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email: String,
    pub token: String,
}

/// One update fanned out to many recipients.
#[derive(Debug, Clone)]
pub struct BatchedUpdate {
    pub recipients: Vec<Recipient>,
    pub page: Page,
    pub report_title: String,
    pub status: UpdateStatus,
    pub message: String,
    pub date: DateTime<Utc>,
    pub components: Vec<String>,
}

#[async_trait]
pub trait EmailClient: Send + Sync {
    async fn send_verification_email(
        &self,
        to: &str,
        link: &str,
        page_name: &str,
    ) -> Result<(), EmailClientError>;

    /// Sends every chunk even when an earlier one fails, then reports the
    /// first failure.
    async fn send_batched_update(&self, update: &BatchedUpdate) -> Result<(), EmailClientError>;
}

#[derive(Debug, Serialize)]
struct OutgoingEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: String,
    text: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<&'static str, String>,
}

#[derive(Debug, Clone)]
pub struct HttpEmailClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
    base_domain: String,
    batch_size: usize,
    initial_interval: Duration,
    max_elapsed_time: Duration,
}

impl HttpEmailClient {
    pub fn new(
        client: reqwest::Client,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
        base_domain: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            from: from.into(),
            base_domain: base_domain.into(),
            batch_size: 100,
            initial_interval: Duration::from_millis(500),
            max_elapsed_time: Duration::from_secs(60),
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::new(
            client,
            &settings.email_api_url,
            &settings.email_api_key,
            &settings.email_from,
            &settings.page_base_domain,
        )
        .with_batch_size(settings.email_batch_size))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_retry(mut self, initial_interval: Duration, max_elapsed_time: Duration) -> Self {
        self.initial_interval = initial_interval;
        self.max_elapsed_time = max_elapsed_time;
        self
    }

    fn update_email<'a>(
        &'a self,
        update: &BatchedUpdate,
        recipient: &'a Recipient,
    ) -> OutgoingEmail<'a> {
        let unsubscribe_url = update
            .page
            .unsubscribe_url(&self.base_domain, &recipient.token);

        let mut text = format!("{}\nStatus: {}\n", update.report_title, update.status);
        if !update.components.is_empty() {
            text.push_str(&format!("Affected: {}\n", update.components.join(", ")));
        }
        text.push_str(&format!(
            "{}\n\n{}\n\n--\nUnsubscribe: {}\n",
            update.date.format("%Y-%m-%d %H:%M UTC"),
            update.message,
            unsubscribe_url
        ));

        let mut headers = BTreeMap::new();
        headers.insert("List-Unsubscribe", format!("<{}>", unsubscribe_url));

        OutgoingEmail {
            from: &self.from,
            to: [recipient.email.as_str()],
            subject: format!("[{}] {}", update.page.title, update.report_title),
            text,
            headers,
        }
    }

    async fn post<T: Serialize + Sync + ?Sized>(
        &self,
        path: &str,
        payload: &T,
    ) -> Result<(), EmailClientError> {
        let url = format!("{}/{}", self.api_url.trim_end_matches('/'), path);
        let mut backoff = ExponentialBackoff {
            initial_interval: self.initial_interval,
            max_elapsed_time: Some(self.max_elapsed_time),
            ..Default::default()
        };

        loop {
            let err = match self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(payload)
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    EmailClientError::Status { status, body }
                }
                Err(err) => EmailClientError::Http(err),
            };

            if !err.is_transient() {
                return Err(err);
            }
            match backoff.next_backoff() {
                Some(delay) => {
                    warn!(error = %err, ?delay, path, "email api call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => return Err(err),
            }
        }
    }
}

#[async_trait]
impl EmailClient for HttpEmailClient {
    async fn send_verification_email(
        &self,
        to: &str,
        link: &str,
        page_name: &str,
    ) -> Result<(), EmailClientError> {
        let email = OutgoingEmail {
            from: &self.from,
            to: [to],
            subject: format!("Confirm your subscription to {}", page_name),
            text: format!(
                "You asked to receive status updates from {}.\n\n\
                 Confirm your subscription: {}\n\n\
                 If this wasn't you, ignore this email.\n",
                page_name, link
            ),
            headers: BTreeMap::new(),
        };
        self.post("emails", &email).await
    }

    async fn send_batched_update(&self, update: &BatchedUpdate) -> Result<(), EmailClientError> {
        let mut first_error = None;

        for (index, chunk) in update.recipients.chunks(self.batch_size).enumerate() {
            let emails: Vec<OutgoingEmail<'_>> = chunk
                .iter()
                .map(|recipient| self.update_email(update, recipient))
                .collect();

            match self.post("emails/batch", &emails).await {
                Ok(()) => debug!(chunk = index, size = chunk.len(), "email batch sent"),
                Err(err) => {
                    warn!(chunk = index, size = chunk.len(), error = %err, "email batch failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Captured {
        path: String,
        authorization: Option<String>,
        body: serde_json::Value,
    }

    #[derive(Clone, Default)]
    struct MockApi {
        requests: Arc<Mutex<Vec<Captured>>>,
        statuses: Arc<Mutex<VecDeque<u16>>>,
    }

    async fn record(
        State(api): State<MockApi>,
        uri: Uri,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        api.requests.lock().unwrap().push(Captured {
            path: uri.path().to_string(),
            authorization: headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body,
        });
        let code = api.statuses.lock().unwrap().pop_front().unwrap_or(200);
        StatusCode::from_u16(code).unwrap()
    }

    async fn spawn_api(statuses: &[u16]) -> (String, MockApi) {
        let api = MockApi::default();
        api.statuses.lock().unwrap().extend(statuses.iter().copied());

        let app = Router::new()
            .route("/emails", post(record))
            .route("/emails/batch", post(record))
            .with_state(api.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), api)
    }

    fn client(api_url: &str) -> HttpEmailClient {
        HttpEmailClient::new(
            reqwest::Client::new(),
            api_url,
            "re_test",
            "Status <status@acme.dev>",
            "openstatus.dev",
        )
        .with_retry(Duration::from_millis(5), Duration::from_secs(5))
    }

    fn batched(count: usize) -> BatchedUpdate {
        let update = fixtures::update();
        BatchedUpdate {
            recipients: (0..count)
                .map(|i| Recipient {
                    email: format!("user{}@acme.dev", i),
                    token: format!("token-{}", i),
                })
                .collect(),
            page: fixtures::page(),
            report_title: update.title,
            status: update.status,
            message: update.message,
            date: update.date,
            components: update.page_components,
        }
    }

    #[tokio::test]
    async fn test_verification_email_posts_single_message() {
        let (url, api) = spawn_api(&[]).await;

        client(&url)
            .send_verification_email(
                "jane@acme.dev",
                "https://acme.openstatus.dev/verify/t",
                "Acme",
            )
            .await
            .unwrap();

        let requests = api.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/emails");
        assert_eq!(requests[0].authorization.as_deref(), Some("Bearer re_test"));
        assert_eq!(requests[0].body["to"][0], "jane@acme.dev");
        assert_eq!(requests[0].body["subject"], "Confirm your subscription to Acme");
        assert!(requests[0].body["text"]
            .as_str()
            .unwrap()
            .contains("https://acme.openstatus.dev/verify/t"));
    }

    #[tokio::test]
    async fn test_batched_update_chunks_and_links_per_recipient() {
        let (url, api) = spawn_api(&[]).await;

        client(&url)
            .with_batch_size(2)
            .send_batched_update(&batched(5))
            .await
            .unwrap();

        let requests = api.requests.lock().unwrap();
        let sizes: Vec<usize> = requests
            .iter()
            .map(|r| r.body.as_array().unwrap().len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(requests.iter().all(|r| r.path == "/emails/batch"));

        let last = &requests[2].body[0];
        assert_eq!(last["to"][0], "user4@acme.dev");
        assert_eq!(last["subject"], "[Acme Status] API degraded");
        let text = last["text"].as_str().unwrap();
        assert!(text.contains("https://acme.openstatus.dev/unsubscribe/token-4"));
        assert!(text.contains("Affected: API"));
        assert_eq!(
            last["headers"]["List-Unsubscribe"],
            "<https://acme.openstatus.dev/unsubscribe/token-4>"
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (url, api) = spawn_api(&[500, 429]).await;

        client(&url).send_batched_update(&batched(1)).await.unwrap();

        assert_eq!(api.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let (url, api) = spawn_api(&[422]).await;

        let err = client(&url)
            .send_verification_email("jane@acme.dev", "https://x/verify/t", "Acme")
            .await
            .unwrap_err();

        assert!(matches!(err, EmailClientError::Status { status: 422, .. }));
        assert_eq!(api.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_stop_later_chunks() {
        let (url, api) = spawn_api(&[400]).await;

        let result = client(&url)
            .with_batch_size(1)
            .send_batched_update(&batched(3))
            .await;

        assert!(result.is_err());
        assert_eq!(api.requests.lock().unwrap().len(), 3);
    }
}
